//! End-to-end pipeline tests against the emulated capture device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use helios::device::fake::{FakeDriver, FakeHandle};
use helios::device::{CameraDevice, CaptureTuning, DeviceState};
use helios::notify::jpeg::SoftJpegEncoder;
use helios::notify::{
    CallbackNotifier, CameraCallbacks, HeapAllocator, HostAllocator, HostMemory, MessageMask,
};
use helios::pipeline::SnapshotSync;
use helios::preview::{ChannelPreview, PreviewTarget};
use helios::{Camera, Config, PixelFormat};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Notify(MessageMask, i32),
    Data(MessageMask, usize),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn callbacks(&self) -> CameraCallbacks {
        let (n, d) = (self.events.clone(), self.events.clone());
        CameraCallbacks {
            notify: Box::new(move |msg, a, _| n.lock().unwrap().push(Event::Notify(msg, a))),
            data: Box::new(move |msg, mem| d.lock().unwrap().push(Event::Data(msg, mem.len()))),
            data_timestamp: Box::new(|_, _, _| {}),
        }
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn tuning() -> CaptureTuning {
    CaptureTuning {
        streaming_buffers: 4,
        snapshot_buffers: 2,
        preview_interval: Duration::ZERO,
    }
}

fn device_parts() -> (
    CameraDevice,
    FakeHandle,
    Arc<CallbackNotifier>,
    Arc<SnapshotSync>,
    Arc<PreviewTarget>,
) {
    let (driver, handle) = FakeDriver::new();
    let notifier = Arc::new(CallbackNotifier::new(Box::new(SoftJpegEncoder)));
    let snapshot = Arc::new(SnapshotSync::new());
    let preview = Arc::new(PreviewTarget::new());
    let device = CameraDevice::new(
        Box::new(driver),
        tuning(),
        preview.clone(),
        notifier.clone(),
        snapshot.clone(),
    );
    (device, handle, notifier, snapshot, preview)
}

#[test]
fn frames_flow_and_every_buffer_returns_to_the_driver() {
    let (device, handle, _notifier, _snapshot, _preview) = device_parts();
    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();

    handle.allow_frames(20);
    assert!(
        wait_until(Duration::from_secs(2), || handle.delivered() >= 20),
        "capture loop did not consume its frame budget"
    );

    // once the budget is drained and the loop idles, every slot must be back
    // driver-owned
    assert!(
        wait_until(Duration::from_secs(2), || handle.queued_depth() == 4),
        "a buffer leaked out of the rotation"
    );
    assert_eq!(handle.requeue_errors(), 0);
    device.stop().unwrap();
    device.disconnect().unwrap();
}

#[test]
fn armed_snapshot_diverts_exactly_one_frame() {
    let (device, handle, notifier, snapshot, _preview) = device_parts();
    let recorder = Recorder::default();
    notifier.set_callbacks(recorder.callbacks(), Arc::new(HeapAllocator));
    notifier.enable_message(MessageMask::SHUTTER | MessageMask::COMPRESSED_IMAGE);

    device.connect().unwrap();
    snapshot.arm().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();

    handle.allow_frames(5);
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 5));
    device.stop().unwrap();

    assert_eq!(
        recorder.count(|e| matches!(e, Event::Notify(m, _) if *m == MessageMask::SHUTTER)),
        1,
        "shutter must fire exactly once"
    );
    assert_eq!(
        recorder.count(|e| matches!(e, Event::Data(m, _) if *m == MessageMask::COMPRESSED_IMAGE)),
        1,
        "one armed frame, one compressed image"
    );
    assert!(!snapshot.is_armed(), "arm consumed by the first frame");
}

#[test]
fn armed_session_runs_with_the_reduced_buffer_count() {
    let (device, handle, _notifier, snapshot, _preview) = device_parts();
    device.connect().unwrap();
    snapshot.arm().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();
    handle.allow_frames(1);
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 1));
    assert!(
        wait_until(Duration::from_secs(2), || handle.queued_depth() == 2),
        "snapshot sessions use two buffers"
    );
    device.stop().unwrap();
}

#[test]
fn preview_frames_are_paced_below_the_capture_rate() {
    let (driver, handle) = FakeDriver::new();
    let notifier = Arc::new(CallbackNotifier::new(Box::new(SoftJpegEncoder)));
    let snapshot = Arc::new(SnapshotSync::new());
    let preview = Arc::new(PreviewTarget::new());
    let device = CameraDevice::new(
        Box::new(driver),
        CaptureTuning {
            streaming_buffers: 4,
            snapshot_buffers: 2,
            preview_interval: Duration::from_millis(66),
        },
        preview.clone(),
        notifier,
        snapshot,
    );

    let (sink, frames) = ChannelPreview::new(64);
    preview.set_sink(Some(Box::new(sink)));
    preview.enable();

    // fake timestamps advance 33ms per frame, preview interval is 66ms
    handle.set_frame_interval(Duration::from_millis(33));
    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();
    handle.allow_frames(30);
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 30));
    device.stop().unwrap();

    let forwarded = frames.drain().count();
    assert!(
        (13..=16).contains(&forwarded),
        "expected roughly half the frames on the surface, got {forwarded}"
    );
}

#[test]
fn backwards_driver_timestamps_are_clamped_monotone() {
    let (driver, handle) = FakeDriver::new();
    let notifier = Arc::new(CallbackNotifier::new(Box::new(SoftJpegEncoder)));
    let snapshot = Arc::new(SnapshotSync::new());
    let preview = Arc::new(PreviewTarget::new());
    let device = CameraDevice::new(
        Box::new(driver),
        tuning(),
        preview.clone(),
        notifier,
        snapshot,
    );

    let (sink, frames) = ChannelPreview::new(64);
    preview.set_sink(Some(Box::new(sink)));
    preview.enable();

    handle.set_frame_interval(Duration::from_millis(33));
    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();

    handle.allow_frames(5);
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 5));

    // sensor clock jumps backwards mid-stream
    handle.rewind_clock(Duration::from_secs(1));
    handle.allow_frames(5);
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 10));
    device.stop().unwrap();

    let stamps: Vec<_> = frames.drain().map(|f| f.timestamp).collect();
    assert_eq!(stamps.len(), 10);
    assert!(
        stamps.windows(2).all(|w| w[0] <= w[1]),
        "delivered timestamps regressed: {stamps:?}"
    );
    // the post-jump frames are pinned to the last good timestamp
    assert_eq!(stamps[5], stamps[4]);
}

#[test]
fn stop_halts_delivery_the_moment_it_returns() {
    let (device, handle, notifier, _snapshot, _preview) = device_parts();
    let recorder = Recorder::default();
    notifier.set_callbacks(recorder.callbacks(), Arc::new(HeapAllocator));
    notifier.enable_message(MessageMask::PREVIEW_FRAME);

    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();
    handle.allow_frames(u64::MAX / 2);
    assert!(wait_until(Duration::from_secs(2), || {
        recorder.count(|e| matches!(e, Event::Data(_, _))) >= 5
    }));

    // stop joins the capture thread, so no delivery can straggle in after it
    // returns
    device.stop().unwrap();
    let deliveries_at_stop = recorder.count(|e| matches!(e, Event::Data(_, _)));
    let frames_at_stop = handle.delivered();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        recorder.count(|e| matches!(e, Event::Data(_, _))),
        deliveries_at_stop,
        "a callback fired after stop returned"
    );
    assert_eq!(handle.delivered(), frames_at_stop);
    device.disconnect().unwrap();
}

#[test]
fn failed_restart_rolls_back_the_armed_snapshot() {
    let (driver, handle) = FakeDriver::new();
    let camera = Camera::new(
        Box::new(driver),
        Box::new(SoftJpegEncoder),
        &Config::default(),
    );
    camera.connect().unwrap();
    camera.start_preview().unwrap();
    handle.allow_frames(u64::MAX / 2);

    handle.fail_next_stream_ons(1);
    assert!(camera.take_picture().is_err());
    assert_eq!(camera.state(), DeviceState::Connected);

    // the arm was rolled back, so a fresh attempt is not refused as already
    // armed
    camera.start_preview().unwrap();
    camera.take_picture().unwrap();

    camera.stop_preview().unwrap();
    camera.disconnect().unwrap();
}

#[test]
fn repeated_dequeue_failures_raise_the_error_message() {
    let (device, handle, notifier, _snapshot, _preview) = device_parts();
    let recorder = Recorder::default();
    notifier.set_callbacks(recorder.callbacks(), Arc::new(HeapAllocator));
    notifier.enable_message(MessageMask::ERROR);

    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();

    handle.fail_next_dequeues(3);
    handle.allow_frames(5);
    assert!(
        wait_until(Duration::from_secs(2), || {
            recorder.count(|e| matches!(e, Event::Notify(m, _) if *m == MessageMask::ERROR)) >= 1
        }),
        "three consecutive dequeue failures must surface as an error message"
    );
    // the loop recovers once the fault clears
    assert!(wait_until(Duration::from_secs(2), || handle.delivered() >= 5));
    device.stop().unwrap();
    device.disconnect().unwrap();
}

#[test]
fn counting_allocator_sees_every_preview_delivery() {
    struct CountingAllocator(AtomicU64);
    impl HostAllocator for CountingAllocator {
        fn request(&self, size: usize, count: usize) -> Option<HostMemory> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(HostMemory::new(size * count.max(1)))
        }
    }

    let (device, handle, notifier, _snapshot, _preview) = device_parts();
    let recorder = Recorder::default();
    let allocator = Arc::new(CountingAllocator(AtomicU64::new(0)));
    notifier.set_callbacks(recorder.callbacks(), allocator.clone());
    notifier.enable_message(MessageMask::PREVIEW_FRAME);

    device.connect().unwrap();
    device.start(320, 240, PixelFormat::Nv12).unwrap();
    handle.allow_frames(10);
    assert!(wait_until(Duration::from_secs(2), || {
        recorder.count(|e| matches!(e, Event::Data(m, _) if *m == MessageMask::PREVIEW_FRAME)) >= 10
    }));
    device.stop().unwrap();

    assert_eq!(allocator.0.load(Ordering::SeqCst), 10);
    assert_eq!(
        recorder.count(|e| matches!(e, Event::Data(m, _) if *m == MessageMask::PREVIEW_FRAME)),
        10
    );
}

#[test]
fn take_picture_restarts_and_delivers_a_jpeg() {
    let (driver, handle) = FakeDriver::new();
    let camera = Camera::new(
        Box::new(driver),
        Box::new(SoftJpegEncoder),
        &Config::default(),
    );
    let recorder = Recorder::default();
    camera.set_callbacks(recorder.callbacks(), Arc::new(HeapAllocator));
    camera.enable_message(MessageMask::SHUTTER | MessageMask::COMPRESSED_IMAGE);

    camera.connect().unwrap();
    camera.start_preview().unwrap();
    assert_eq!(camera.state(), DeviceState::Started);

    // keep frames flowing across the prepared-frame wait and the restart
    handle.allow_frames(u64::MAX / 2);
    camera.take_picture().unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            recorder.count(|e| matches!(e, Event::Data(m, _) if *m == MessageMask::COMPRESSED_IMAGE))
                >= 1
        }),
        "still capture never produced a compressed image"
    );
    assert_eq!(
        recorder.count(|e| matches!(e, Event::Notify(m, _) if *m == MessageMask::SHUTTER)),
        1
    );

    camera.stop_preview().unwrap();
    camera.disconnect().unwrap();
    assert_eq!(camera.state(), DeviceState::Uninitialized);
}

#[test]
fn stopping_preview_while_recording_keeps_the_stream_alive() {
    let (driver, handle) = FakeDriver::new();
    let camera = Camera::new(
        Box::new(driver),
        Box::new(SoftJpegEncoder),
        &Config::default(),
    );
    camera.connect().unwrap();
    camera.start_preview().unwrap();
    camera.start_recording().unwrap();
    handle.allow_frames(2);

    camera.stop_preview().unwrap();
    assert_eq!(
        camera.state(),
        DeviceState::Started,
        "recording still needs frames"
    );

    camera.stop_recording().unwrap();
    assert_eq!(camera.state(), DeviceState::Connected);
    camera.disconnect().unwrap();
}
