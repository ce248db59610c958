//! Emulated capture device.
//!
//! Renders a black and white checker board moving diagonally, the classic
//! stand-in for a sensor when no real device node exists. The handle side
//! lets tests script frame budgets and inject driver faults; the binary uses
//! the paced mode as a fallback when auto-detection finds no camera.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::device::driver::{
    CaptureDriver, DriverFrame, DriverInfo, FormatRequest, LoopWaker, Readiness,
};
use crate::device::frame::FrameGeometry;
use crate::utils::relock;
use crate::{CameraError, Result};

const MAX_FAKE_WIDTH: u32 = 1280;
const MAX_FAKE_HEIGHT: u32 = 720;
const CHECKER_CELL: usize = 16;

struct FakeInner {
    opened: bool,
    streaming: bool,
    geometry: Option<FrameGeometry>,
    buffers: Vec<Vec<u8>>,
    queued: VecDeque<u32>,
    /// Frames the driver is still willing to deliver.
    budget: u64,
    fail_dequeues: u32,
    fail_stream_ons: u32,
    woken: bool,
    clock: Duration,
    frame_interval: Duration,
    pace: bool,
    next_due: Option<Instant>,
    phase: usize,
    delivered: u64,
    requeue_errors: u64,
}

struct FakeState {
    inner: Mutex<FakeInner>,
    cond: Condvar,
}

pub struct FakeDriver {
    state: Arc<FakeState>,
}

/// Test/control side of a [`FakeDriver`].
#[derive(Clone)]
pub struct FakeHandle {
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new() -> (Self, FakeHandle) {
        let state = Arc::new(FakeState {
            inner: Mutex::new(FakeInner {
                opened: false,
                streaming: false,
                geometry: None,
                buffers: Vec::new(),
                queued: VecDeque::new(),
                budget: 0,
                fail_dequeues: 0,
                fail_stream_ons: 0,
                woken: false,
                clock: Duration::ZERO,
                frame_interval: Duration::from_millis(33),
                pace: false,
                next_due: None,
                phase: 0,
                delivered: 0,
                requeue_errors: 0,
            }),
            cond: Condvar::new(),
        });
        (
            Self {
                state: state.clone(),
            },
            FakeHandle { state },
        )
    }

    /// Free-running mode for the demo binary: unlimited budget, frames held
    /// back to the configured interval.
    pub fn paced(fps: u32) -> Self {
        let (driver, handle) = Self::new();
        {
            let mut inner = relock(&handle.state.inner);
            inner.budget = u64::MAX;
            inner.pace = true;
            if fps > 0 {
                inner.frame_interval = Duration::from_micros(1_000_000 / u64::from(fps));
            }
        }
        driver
    }

    fn render(inner: &mut FakeInner, index: usize) {
        let Some(geometry) = inner.geometry else {
            return;
        };
        let phase = inner.phase;
        let width = geometry.width as usize;
        let height = geometry.height as usize;
        let buf = &mut inner.buffers[index];
        for y in 0..height.min(buf.len() / width.max(1)) {
            let row = &mut buf[y * width..(y + 1) * width];
            for (x, px) in row.iter_mut().enumerate() {
                let cell = ((x + phase) / CHECKER_CELL + (y + phase) / CHECKER_CELL) % 2;
                *px = if cell == 0 { 0x10 } else { 0xf0 };
            }
        }
        // chroma plane (if any) stays neutral
        let luma = width * height;
        if buf.len() > luma {
            buf[luma..].fill(0x80);
        }
        inner.phase = phase.wrapping_add(2);
    }
}

impl CaptureDriver for FakeDriver {
    fn open(&mut self) -> Result<DriverInfo> {
        let mut inner = relock(&self.state.inner);
        inner.opened = true;
        Ok(DriverInfo {
            card: "helios emulated sensor".into(),
            driver: "fake".into(),
        })
    }

    fn close(&mut self) {
        let mut inner = relock(&self.state.inner);
        inner.opened = false;
        inner.streaming = false;
    }

    fn negotiate(&mut self, request: &FormatRequest) -> Result<FrameGeometry> {
        let mut inner = relock(&self.state.inner);
        if !inner.opened {
            return Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::NotConnected,
                "device not open",
            )));
        }
        // substitute the nearest size we can do, like a real driver would
        let width = request.width.clamp(CHECKER_CELL as u32, MAX_FAKE_WIDTH) & !0xf;
        let height = request.height.clamp(CHECKER_CELL as u32, MAX_FAKE_HEIGHT) & !0xf;
        let geometry = FrameGeometry {
            width,
            height,
            format: request.format,
            frame_size: request.format.frame_size(width, height),
        };
        inner.geometry = Some(geometry);
        debug!(
            width,
            height,
            requested_width = request.width,
            requested_height = request.height,
            "fake driver negotiated format"
        );
        Ok(geometry)
    }

    fn stream_on(&mut self, buffers: u32) -> Result<u32> {
        let mut inner = relock(&self.state.inner);
        if inner.fail_stream_ons > 0 {
            inner.fail_stream_ons -= 1;
            return Err(CameraError::DriverIo(io::Error::other(
                "injected stream-on failure",
            )));
        }
        let Some(geometry) = inner.geometry else {
            return Err(CameraError::UnsupportedFormat(
                "stream-on before format negotiation".into(),
            ));
        };
        inner.buffers = vec![vec![0u8; geometry.frame_size]; buffers as usize];
        inner.queued = (0..buffers).collect();
        inner.streaming = true;
        self.state.cond.notify_all();
        Ok(buffers)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut inner = relock(&self.state.inner);
        inner.streaming = false;
        inner.queued.clear();
        inner.buffers.clear();
        inner.next_due = None;
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        let mut inner = relock(&self.state.inner);
        loop {
            if inner.woken {
                inner.woken = false;
                return Ok(Readiness::Cancelled);
            }
            let mut until = deadline;
            if inner.streaming && inner.budget > 0 && !inner.queued.is_empty() {
                match inner.next_due {
                    Some(due) if Instant::now() < due => until = due.min(deadline),
                    _ => return Ok(Readiness::Frame),
                }
            }
            let now = Instant::now();
            if now >= until && until == deadline {
                return Ok(Readiness::TimedOut);
            }
            let wait = until.saturating_duration_since(now);
            let (guard, _) = self
                .state
                .cond
                .wait_timeout(inner, wait)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
        }
    }

    fn dequeue(&mut self) -> Result<DriverFrame> {
        let mut inner = relock(&self.state.inner);
        if inner.fail_dequeues > 0 {
            inner.fail_dequeues -= 1;
            return Err(CameraError::DriverIo(io::Error::other(
                "injected dequeue failure",
            )));
        }
        if !inner.streaming {
            return Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream is off",
            )));
        }
        let Some(index) = inner.queued.pop_front() else {
            return Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no filled buffer",
            )));
        };
        inner.budget = inner.budget.saturating_sub(1);
        inner.delivered += 1;
        let interval = inner.frame_interval;
        inner.clock += interval;
        if inner.pace {
            inner.next_due = Some(Instant::now() + interval);
        }
        Self::render(&mut inner, index as usize);
        Ok(DriverFrame {
            index,
            data: Bytes::copy_from_slice(&inner.buffers[index as usize]),
            timestamp: inner.clock,
        })
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        let mut inner = relock(&self.state.inner);
        if index as usize >= inner.buffers.len() {
            return Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("requeue of unknown buffer {index}"),
            )));
        }
        if inner.queued.contains(&index) {
            inner.requeue_errors += 1;
            return Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {index} already queued"),
            )));
        }
        inner.queued.push_back(index);
        self.state.cond.notify_all();
        Ok(())
    }

    fn waker(&self) -> LoopWaker {
        let state = self.state.clone();
        LoopWaker::new(move || {
            let mut inner = relock(&state.inner);
            inner.woken = true;
            state.cond.notify_all();
        })
    }
}

impl FakeHandle {
    /// Let the driver deliver `n` more frames.
    pub fn allow_frames(&self, n: u64) {
        let mut inner = relock(&self.state.inner);
        inner.budget = inner.budget.saturating_add(n);
        self.state.cond.notify_all();
    }

    /// Make the next `n` dequeues fail with a driver i/o error.
    pub fn fail_next_dequeues(&self, n: u32) {
        relock(&self.state.inner).fail_dequeues = n;
    }

    /// Make the next `n` stream-on attempts fail with a driver i/o error.
    pub fn fail_next_stream_ons(&self, n: u32) {
        relock(&self.state.inner).fail_stream_ons = n;
    }

    /// Step the driver clock backwards, emulating a sensor clock that jumps
    /// across a restart.
    pub fn rewind_clock(&self, by: Duration) {
        let mut inner = relock(&self.state.inner);
        inner.clock = inner.clock.saturating_sub(by);
    }

    pub fn set_frame_interval(&self, interval: Duration) {
        relock(&self.state.inner).frame_interval = interval;
    }

    pub fn delivered(&self) -> u64 {
        relock(&self.state.inner).delivered
    }

    pub fn requeue_errors(&self) -> u64 {
        relock(&self.state.inner).requeue_errors
    }

    /// Buffers currently driver-owned.
    pub fn queued_depth(&self) -> usize {
        relock(&self.state.inner).queued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::frame::PixelFormat;

    fn request() -> FormatRequest {
        FormatRequest {
            width: 320,
            height: 240,
            format: PixelFormat::Nv12,
        }
    }

    #[test]
    fn delivers_scripted_budget_then_times_out() {
        let (mut driver, handle) = FakeDriver::new();
        driver.open().unwrap();
        driver.negotiate(&request()).unwrap();
        driver.stream_on(3).unwrap();
        handle.allow_frames(2);

        for _ in 0..2 {
            assert_eq!(
                driver.wait_frame(Duration::from_millis(100)).unwrap(),
                Readiness::Frame
            );
            let frame = driver.dequeue().unwrap();
            driver.requeue(frame.index).unwrap();
        }
        assert_eq!(
            driver.wait_frame(Duration::from_millis(10)).unwrap(),
            Readiness::TimedOut
        );
        assert_eq!(handle.delivered(), 2);
    }

    #[test]
    fn waker_interrupts_the_wait() {
        let (mut driver, _handle) = FakeDriver::new();
        driver.open().unwrap();
        let waker = driver.waker();
        waker.wake();
        assert_eq!(
            driver.wait_frame(Duration::from_secs(2)).unwrap(),
            Readiness::Cancelled
        );
    }

    #[test]
    fn double_requeue_is_reported() {
        let (mut driver, handle) = FakeDriver::new();
        driver.open().unwrap();
        driver.negotiate(&request()).unwrap();
        driver.stream_on(2).unwrap();
        handle.allow_frames(1);
        let frame = driver.dequeue().unwrap();
        driver.requeue(frame.index).unwrap();
        assert!(driver.requeue(frame.index).is_err());
        assert_eq!(handle.requeue_errors(), 1);
    }

    #[test]
    fn timestamps_advance_per_frame() {
        let (mut driver, handle) = FakeDriver::new();
        driver.open().unwrap();
        driver.negotiate(&request()).unwrap();
        driver.stream_on(2).unwrap();
        handle.set_frame_interval(Duration::from_millis(10));
        handle.allow_frames(2);
        let first = driver.dequeue().unwrap();
        driver.requeue(first.index).unwrap();
        let second = driver.dequeue().unwrap();
        assert!(second.timestamp > first.timestamp);
    }
}
