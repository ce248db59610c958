//! Preview surface boundary.
//!
//! The pipeline knows two ways to hand a frame to a surface: a shared
//! descriptor (no copy, the consumer reads the capture buffer view) or a
//! copied image. A surface that cannot take the current geometry answers
//! `Rejected` and the router downgrades to the copied path for the rest of
//! the session; a momentarily full surface answers `Busy` and only loses
//! that one frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::device::frame::{BufferIndex, FrameGeometry};
use crate::utils::relock;

#[derive(Debug)]
pub enum PreviewError {
    /// Transient; drop this frame's preview delivery only.
    Busy,
    /// Permanent for this session; the router falls back to copying.
    Rejected(String),
}

impl std::fmt::Display for PreviewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewError::Busy => f.write_str("surface busy"),
            PreviewError::Rejected(reason) => write!(f, "surface rejected frame: {reason}"),
        }
    }
}

/// Shared-memory style frame descriptor handed to a surface on the zero-copy
/// path.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    pub data: Bytes,
    pub geometry: FrameGeometry,
    pub timestamp: Duration,
    pub source: BufferIndex,
}

pub trait PreviewSink: Send {
    /// Whether the sink accepts shared descriptors at all. Probed once per
    /// device start.
    fn supports_shared(&self) -> bool {
        true
    }

    fn render_shared(&mut self, frame: &SharedFrame) -> Result<(), PreviewError>;

    fn render_copied(
        &mut self,
        data: &[u8],
        geometry: &FrameGeometry,
        timestamp: Duration,
    ) -> Result<(), PreviewError>;
}

/// The router's stable handle to whatever surface is currently attached.
pub struct PreviewTarget {
    enabled: AtomicBool,
    visible: AtomicBool,
    sink: Mutex<Option<Box<dyn PreviewSink>>>,
}

impl Default for PreviewTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewTarget {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: Option<Box<dyn PreviewSink>>) {
        *relock(&self.sink) = sink;
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn show(&self) {
        self.visible.store(true, Ordering::Release);
    }

    pub fn hide(&self) {
        self.visible.store(false, Ordering::Release);
    }

    pub fn supports_shared(&self) -> bool {
        relock(&self.sink)
            .as_ref()
            .map_or(false, |s| s.supports_shared())
    }

    /// A hidden or detached surface swallows frames successfully; only an
    /// attached, visible surface can fail delivery.
    pub fn render_shared(&self, frame: &SharedFrame) -> Result<(), PreviewError> {
        if !self.visible.load(Ordering::Acquire) {
            return Ok(());
        }
        match relock(&self.sink).as_mut() {
            Some(sink) => sink.render_shared(frame),
            None => Ok(()),
        }
    }

    pub fn render_copied(
        &self,
        data: &[u8],
        geometry: &FrameGeometry,
        timestamp: Duration,
    ) -> Result<(), PreviewError> {
        if !self.visible.load(Ordering::Acquire) {
            return Ok(());
        }
        match relock(&self.sink).as_mut() {
            Some(sink) => sink.render_copied(data, geometry, timestamp),
            None => Ok(()),
        }
    }
}

/// Frame as seen by a channel-backed preview consumer.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp: Duration,
}

/// Preview surface that fans frames out over a bounded channel. A full
/// channel is a busy surface, not a stall: the capture loop never blocks on
/// a slow consumer.
pub struct ChannelPreview {
    tx: flume::Sender<PreviewFrame>,
}

impl ChannelPreview {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<PreviewFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }

    fn push(&self, frame: PreviewFrame) -> Result<(), PreviewError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(PreviewError::Busy),
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(PreviewError::Rejected("consumer went away".into()))
            }
        }
    }
}

impl PreviewSink for ChannelPreview {
    fn render_shared(&mut self, frame: &SharedFrame) -> Result<(), PreviewError> {
        self.push(PreviewFrame {
            data: frame.data.clone(),
            width: frame.geometry.width,
            height: frame.geometry.height,
            timestamp: frame.timestamp,
        })
    }

    fn render_copied(
        &mut self,
        data: &[u8],
        geometry: &FrameGeometry,
        timestamp: Duration,
    ) -> Result<(), PreviewError> {
        self.push(PreviewFrame {
            data: Bytes::copy_from_slice(data),
            width: geometry.width,
            height: geometry.height,
            timestamp,
        })
    }
}
