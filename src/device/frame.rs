use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Yuyv,
    Rgb24,
}

impl PixelFormat {
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Rgb24 => b"RGB3",
        }
    }

    /// Nominal frame size in bytes for a full frame at the given geometry.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 => pixels * 3 / 2,
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Rgb24 => pixels * 3,
        }
    }
}

/// The geometry the driver actually agreed to. The driver may substitute a
/// nearby supported size, so this is always read back after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_size: usize,
}

/// Typed index into the buffer pool. Never a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferIndex(pub u32);

impl std::fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One captured frame, detached from the driver's buffer queue.
///
/// The frame holds a shared view of the buffer contents; the originating pool
/// slot stays application-owned until the capture loop releases it, exactly
/// once, whatever path consumed the frame.
#[derive(Clone)]
pub struct CapturedFrame {
    pub index: BufferIndex,
    pub data: Bytes,
    /// Driver timestamp, clamped monotone non-decreasing by the capture loop.
    pub timestamp: Duration,
    pub sequence: u64,
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .finish()
    }
}
