//! Callback plumbing between the capture pipeline and its host.
//!
//! The notifier owns the message mask, the host memory factory and the
//! per-session still parameters. Everything here is gating and buffer
//! handling: no frame is ever blocked from capture because a message is
//! disabled, only its notification is suppressed.

pub mod jpeg;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::device::frame::{CapturedFrame, FrameGeometry};
use crate::notify::jpeg::{JpegEncoder, JpegParams};
use crate::utils::relock;

/// Error code delivered through the error message, for faults that have no
/// more specific code.
pub const ERROR_UNKNOWN: i32 = 1;

bitflags! {
    /// Notification categories a host can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageMask: u32 {
        const ERROR            = 0x0001;
        const SHUTTER          = 0x0002;
        const FOCUS            = 0x0004;
        const ZOOM             = 0x0008;
        const PREVIEW_FRAME    = 0x0010;
        const VIDEO_FRAME      = 0x0020;
        const POSTVIEW_FRAME   = 0x0040;
        const RAW_IMAGE        = 0x0080;
        const COMPRESSED_IMAGE = 0x0100;
        const RAW_IMAGE_NOTIFY = 0x0200;
        const PREVIEW_METADATA = 0x0400;
    }
}

/// Host-allocated buffer the notifier fills and hands out.
///
/// Move-only by construction: the release hook runs exactly once, in `Drop`,
/// however far the handle traveled.
pub struct HostMemory {
    data: Box<[u8]>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            on_release: None,
        }
    }

    pub fn with_release(size: usize, on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl Deref for HostMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for HostMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Factory for host-owned shared buffers.
pub trait HostAllocator: Send + Sync {
    fn request(&self, size: usize, count: usize) -> Option<HostMemory>;
}

/// Plain heap allocator, used when the host does not install its own.
pub struct HeapAllocator;

impl HostAllocator for HeapAllocator {
    fn request(&self, size: usize, count: usize) -> Option<HostMemory> {
        Some(HostMemory::new(size.checked_mul(count.max(1))?))
    }
}

/// The host's callback surface.
pub struct CameraCallbacks {
    /// Event notifications: shutter, focus result, errors.
    pub notify: Box<dyn Fn(MessageMask, i32, i32) + Send + Sync>,
    /// Data deliveries: preview, raw, postview, compressed image.
    pub data: Box<dyn Fn(MessageMask, HostMemory) + Send + Sync>,
    /// Timestamped data deliveries: video frames.
    pub data_timestamp: Box<dyn Fn(Duration, MessageMask, HostMemory) + Send + Sync>,
}

impl CameraCallbacks {
    pub fn noop() -> Self {
        Self {
            notify: Box::new(|_, _, _| {}),
            data: Box::new(|_, _| {}),
            data_timestamp: Box::new(|_, _, _| {}),
        }
    }
}

struct NotifierInner {
    callbacks: Option<Arc<CameraCallbacks>>,
    allocator: Arc<dyn HostAllocator>,
    params: JpegParams,
}

/// Owns message gating and drives the host callbacks with correctly-owned
/// buffers.
///
/// The registration lock is only held long enough to snapshot the callback
/// table; callbacks run outside it, so a host callback may call back into
/// the notifier.
pub struct CallbackNotifier {
    mask: AtomicU32,
    recording: AtomicBool,
    encoder: Box<dyn JpegEncoder>,
    inner: Mutex<NotifierInner>,
}

impl CallbackNotifier {
    pub fn new(encoder: Box<dyn JpegEncoder>) -> Self {
        Self {
            mask: AtomicU32::new(0),
            recording: AtomicBool::new(false),
            encoder,
            inner: Mutex::new(NotifierInner {
                callbacks: None,
                allocator: Arc::new(HeapAllocator),
                params: JpegParams::default(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(Box::new(jpeg::SoftJpegEncoder))
    }

    pub fn set_callbacks(&self, callbacks: CameraCallbacks, allocator: Arc<dyn HostAllocator>) {
        let mut inner = relock(&self.inner);
        inner.callbacks = Some(Arc::new(callbacks));
        inner.allocator = allocator;
    }

    /// Snapshot the host registration so delivery happens outside the lock.
    fn host(&self) -> Option<(Arc<CameraCallbacks>, Arc<dyn HostAllocator>)> {
        let inner = relock(&self.inner);
        let callbacks = inner.callbacks.clone()?;
        Some((callbacks, inner.allocator.clone()))
    }

    pub fn enable_message(&self, messages: MessageMask) {
        let now = self.mask.fetch_or(messages.bits(), Ordering::AcqRel) | messages.bits();
        debug!(enabled = ?MessageMask::from_bits_truncate(now), "messages enabled");
    }

    pub fn disable_message(&self, messages: MessageMask) {
        let now = self.mask.fetch_and(!messages.bits(), Ordering::AcqRel) & !messages.bits();
        debug!(enabled = ?MessageMask::from_bits_truncate(now), "messages disabled");
    }

    pub fn is_message_enabled(&self, messages: MessageMask) -> bool {
        MessageMask::from_bits_truncate(self.mask.load(Ordering::Acquire)).contains(messages)
    }

    pub fn enable_recording(&self) {
        self.recording.store(true, Ordering::Release);
    }

    pub fn disable_recording(&self) {
        self.recording.store(false, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_jpeg_params(&self, params: JpegParams) {
        relock(&self.inner).params = params;
    }

    pub fn jpeg_params(&self) -> JpegParams {
        relock(&self.inner).params.clone()
    }

    /// Drop everything host-related, called on disconnect.
    pub fn cleanup(&self) {
        self.mask.store(0, Ordering::Release);
        self.recording.store(false, Ordering::Release);
        let mut inner = relock(&self.inner);
        inner.callbacks = None;
        inner.allocator = Arc::new(HeapAllocator);
        inner.params = JpegParams::default();
    }

    pub(crate) fn on_preview_frame(&self, data: &[u8]) {
        if !self.is_message_enabled(MessageMask::PREVIEW_FRAME) {
            return;
        }
        let Some((callbacks, allocator)) = self.host() else {
            return;
        };
        if let Some(mut mem) = Self::alloc(&*allocator, &callbacks, data.len()) {
            mem.copy_from_slice(data);
            (callbacks.data)(MessageMask::PREVIEW_FRAME, mem);
        }
    }

    pub(crate) fn on_video_frame(&self, data: &[u8], timestamp: Duration) {
        if !self.is_recording() || !self.is_message_enabled(MessageMask::VIDEO_FRAME) {
            return;
        }
        let Some((callbacks, allocator)) = self.host() else {
            return;
        };
        if let Some(mut mem) = Self::alloc(&*allocator, &callbacks, data.len()) {
            mem.copy_from_slice(data);
            (callbacks.data_timestamp)(timestamp, MessageMask::VIDEO_FRAME, mem);
        }
    }

    /// Still-image delivery for one armed snapshot frame.
    ///
    /// The sequence is fixed: shutter, raw placeholder, compressed image,
    /// postview. A failure in one sub-step skips only that sub-step. The
    /// armed flag was already consumed by the capture loop, so pending state
    /// is clear whatever happens below.
    pub(crate) fn on_snapshot(&self, frame: &CapturedFrame, geometry: &FrameGeometry) {
        debug!(index = %frame.index, sequence = frame.sequence, "snapshot delivery begins");
        let Some((callbacks, allocator)) = self.host() else {
            warn!("snapshot captured but no callbacks installed");
            return;
        };
        // snapshot the session parameters too; the encode below runs without
        // the registration lock, so caller threads are never stalled on it
        let params = relock(&self.inner).params.clone();

        if self.is_message_enabled(MessageMask::SHUTTER) {
            (callbacks.notify)(MessageMask::SHUTTER, 0, 0);
        }

        if self.is_message_enabled(MessageMask::RAW_IMAGE_NOTIFY) {
            // placeholder payload: the sensor path never produced a real raw
            // image here, and hosts only key off the arrival of the message
            if let Some(mut mem) = Self::alloc(&*allocator, &callbacks, geometry.frame_size) {
                mem.fill(0xff);
                (callbacks.data)(MessageMask::RAW_IMAGE_NOTIFY, mem);
            }
        }

        if self.is_message_enabled(MessageMask::COMPRESSED_IMAGE) {
            match self.encoder.encode(&frame.data, geometry, &params) {
                Ok(encoded) => {
                    if let Some(mut mem) = Self::alloc(&*allocator, &callbacks, encoded.len()) {
                        mem.copy_from_slice(&encoded);
                        (callbacks.data)(MessageMask::COMPRESSED_IMAGE, mem);
                    }
                }
                Err(err) => {
                    warn!(%err, "still compression failed, compressed callback skipped");
                }
            }
        }

        if self.is_message_enabled(MessageMask::POSTVIEW_FRAME) {
            if let Some(mut mem) = Self::alloc(&*allocator, &callbacks, geometry.frame_size) {
                mem.fill(0xff);
                (callbacks.data)(MessageMask::POSTVIEW_FRAME, mem);
            }
        }
        debug!("snapshot delivery ends");
    }

    pub fn on_auto_focus(&self, success: bool) {
        if !self.is_message_enabled(MessageMask::FOCUS) {
            return;
        }
        if let Some((callbacks, _)) = self.host() {
            (callbacks.notify)(MessageMask::FOCUS, i32::from(success), 0);
        }
    }

    pub fn on_device_error(&self, code: i32) {
        if !self.is_message_enabled(MessageMask::ERROR) {
            return;
        }
        if let Some((callbacks, _)) = self.host() {
            (callbacks.notify)(MessageMask::ERROR, code, 0);
        }
    }

    /// One sub-delivery's buffer. An allocation refusal skips the sub-step
    /// and surfaces through the error message if that one is enabled.
    fn alloc(
        allocator: &dyn HostAllocator,
        callbacks: &CameraCallbacks,
        size: usize,
    ) -> Option<HostMemory> {
        match allocator.request(size, 1) {
            Some(mem) => Some(mem),
            None => {
                warn!(size, "host allocator refused a buffer, delivery skipped");
                (callbacks.notify)(MessageMask::ERROR, ERROR_UNKNOWN, 0);
                None
            }
        }
    }
}
