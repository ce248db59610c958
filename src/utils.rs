use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::device::frame::PixelFormat;

/// Lock that survives a panicked holder. The capture-side mutexes only guard
/// plain data, so the data is still usable after a poisoning panic.
pub(crate) fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Detected capture device info
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Option<FoundDevice> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        if let Ok(dev) = Device::with_path(&path) {
            if let Ok(caps) = dev.query_caps() {
                if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                    continue;
                }
                if let Ok(formats) = dev.enum_formats() {
                    for fmt in formats {
                        if fmt.fourcc == FourCC::new(b"NV12") {
                            info!("Found NV12 device: {} - {}", path, caps.card);
                            return Some(FoundDevice {
                                path,
                                format: PixelFormat::Nv12,
                            });
                        } else if fmt.fourcc == FourCC::new(b"YUYV") {
                            info!("Found YUYV device: {} - {}", path, caps.card);
                            return Some(FoundDevice {
                                path,
                                format: PixelFormat::Yuyv,
                            });
                        }
                    }
                }
            }
        }
    }

    None
}
