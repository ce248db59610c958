pub mod camera;
pub mod device;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod preview;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use camera::Camera;
pub use device::frame::{BufferIndex, CapturedFrame, FrameGeometry, PixelFormat};
pub use error::{CameraError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub preview: PreviewConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, e.g. "/dev/video0". Empty string means auto-detect.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Buffers exchanged with the driver during a streaming session.
    pub streaming_buffers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Target preview rate; frames above this rate are captured but not
    /// forwarded to the preview surface.
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Reduced buffer count for a take-picture session.
    pub buffers: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            preview: PreviewConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            width: 800,
            height: 600,
            fps: 30,
            format: PixelFormat::Nv12,
            streaming_buffers: 4,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self { fps: 15 }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            buffers: 2,
            width: 1280,
            height: 720,
        }
    }
}
