//! Device lifecycle: a strict three-state machine around whatever driver is
//! plugged into the seam.
//!
//! State only ever moves one step at a time. Start spawns the capture thread;
//! stop signals it, joins it, and only then tears the stream down, so mapped
//! buffers are never pulled out from under the loop.

pub mod driver;
pub mod fake;
pub mod frame;
pub mod pool;
pub mod v4l2;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::device::driver::{CaptureDriver, FormatRequest, LoopWaker};
use crate::device::frame::{FrameGeometry, PixelFormat};
use crate::device::pool::BufferPool;
use crate::notify::CallbackNotifier;
use crate::pipeline::capture::CaptureWorker;
use crate::pipeline::router::FrameRouter;
use crate::pipeline::snapshot::SnapshotSync;
use crate::preview::PreviewTarget;
use crate::utils::relock;
use crate::{Config, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Connected,
    Started,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Connected => "connected",
            DeviceState::Started => "started",
        };
        f.write_str(s)
    }
}

/// Knobs a session is started with, snapshotted from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct CaptureTuning {
    pub streaming_buffers: u32,
    /// Reduced count while a still picture is armed.
    pub snapshot_buffers: u32,
    pub preview_interval: Duration,
}

impl CaptureTuning {
    pub fn from_config(config: &Config) -> Self {
        let preview_interval = if config.preview.fps > 0 {
            Duration::from_micros(1_000_000 / u64::from(config.preview.fps))
        } else {
            Duration::ZERO
        };
        Self {
            streaming_buffers: config.capture.streaming_buffers.max(1),
            snapshot_buffers: config.snapshot.buffers.max(1),
            preview_interval,
        }
    }
}

struct Worker {
    handle: JoinHandle<Box<dyn CaptureDriver>>,
    waker: LoopWaker,
    cancel: Arc<AtomicBool>,
}

struct DeviceInner {
    state: DeviceState,
    /// Present while no capture thread owns it.
    driver: Option<Box<dyn CaptureDriver>>,
    worker: Option<Worker>,
    geometry: Option<FrameGeometry>,
}

/// The state machine that owns the driver and the capture thread.
pub struct CameraDevice {
    inner: Mutex<DeviceInner>,
    tuning: CaptureTuning,
    preview: Arc<PreviewTarget>,
    notifier: Arc<CallbackNotifier>,
    snapshot: Arc<SnapshotSync>,
}

impl CameraDevice {
    pub fn new(
        driver: Box<dyn CaptureDriver>,
        tuning: CaptureTuning,
        preview: Arc<PreviewTarget>,
        notifier: Arc<CallbackNotifier>,
        snapshot: Arc<SnapshotSync>,
    ) -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Uninitialized,
                driver: Some(driver),
                worker: None,
                geometry: None,
            }),
            tuning,
            preview,
            notifier,
            snapshot,
        }
    }

    pub fn state(&self) -> DeviceState {
        relock(&self.inner).state
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        relock(&self.inner).geometry
    }

    /// Open the driver. A no-op when already connected.
    pub fn connect(&self) -> Result<()> {
        let mut inner = relock(&self.inner);
        match inner.state {
            DeviceState::Connected => Ok(()),
            DeviceState::Started => Err(crate::CameraError::invalid_state("connect", inner.state)),
            DeviceState::Uninitialized => {
                let driver = inner.driver.as_mut().ok_or_else(driver_lost)?;
                let identity = driver.open()?;
                info!(card = %identity.card, driver = %identity.driver, "device connected");
                inner.state = DeviceState::Connected;
                Ok(())
            }
        }
    }

    /// Close the driver. Must not be called while started; a no-op when
    /// already uninitialized.
    pub fn disconnect(&self) -> Result<()> {
        let mut inner = relock(&self.inner);
        match inner.state {
            DeviceState::Uninitialized => Ok(()),
            DeviceState::Started => Err(crate::CameraError::invalid_state("disconnect", inner.state)),
            DeviceState::Connected => {
                if let Some(driver) = inner.driver.as_mut() {
                    driver.close();
                }
                inner.geometry = None;
                inner.state = DeviceState::Uninitialized;
                info!("device disconnected");
                Ok(())
            }
        }
    }

    /// Negotiate the format, prime the buffer queue and spawn the capture
    /// thread. Legal only when connected.
    pub fn start(&self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        let mut inner = relock(&self.inner);
        if inner.state != DeviceState::Connected {
            return Err(crate::CameraError::invalid_state("start", inner.state));
        }
        let mut driver = inner.driver.take().ok_or_else(driver_lost)?;

        let outcome = (|| -> Result<(FrameGeometry, u32)> {
            let geometry = driver.negotiate(&FormatRequest {
                width,
                height,
                format,
            })?;
            // a pending still picture runs with a smaller queue so the armed
            // frame comes out with minimal latency
            let wanted = if self.snapshot.is_armed() {
                self.tuning.snapshot_buffers
            } else {
                self.tuning.streaming_buffers
            };
            let granted = driver.stream_on(wanted)?;
            Ok((geometry, granted))
        })();

        let (geometry, granted) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                // stay connected, the caller may retry with another format
                inner.driver = Some(driver);
                return Err(err);
            }
        };

        let waker = driver.waker();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = CaptureWorker::new(
            driver,
            BufferPool::new(granted),
            FrameRouter::new(self.preview.clone(), geometry, self.tuning.preview_interval),
            self.notifier.clone(),
            self.snapshot.clone(),
            cancel.clone(),
            geometry,
        );
        let handle = std::thread::Builder::new()
            .name("helios-capture".into())
            .spawn(move || worker.run())?;

        inner.worker = Some(Worker {
            handle,
            waker,
            cancel,
        });
        inner.geometry = Some(geometry);
        inner.state = DeviceState::Started;
        info!(?geometry, buffers = granted, "device started");
        Ok(())
    }

    /// Signal the capture thread, join it, then stop the stream. A no-op when
    /// merely connected; illegal when uninitialized.
    pub fn stop(&self) -> Result<()> {
        let mut inner = relock(&self.inner);
        match inner.state {
            DeviceState::Connected => Ok(()),
            DeviceState::Uninitialized => Err(crate::CameraError::invalid_state("stop", inner.state)),
            DeviceState::Started => {
                let worker = inner.worker.take().ok_or_else(driver_lost)?;
                worker.cancel.store(true, Ordering::Release);
                worker.waker.wake();
                let mut driver = match worker.handle.join() {
                    Ok(driver) => driver,
                    Err(_) => {
                        // the loop panicked and took the driver with it
                        inner.state = DeviceState::Uninitialized;
                        return Err(crate::CameraError::DriverIo(io::Error::other(
                            "capture thread panicked",
                        )));
                    }
                };
                // the loop is gone, unmapping is safe now
                if let Err(err) = driver.stream_off() {
                    warn!(%err, "stream-off failed");
                }
                inner.driver = Some(driver);
                inner.state = DeviceState::Connected;
                info!("device stopped");
                Ok(())
            }
        }
    }
}

fn driver_lost() -> crate::CameraError {
    crate::CameraError::DriverIo(io::Error::other("driver handle lost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDriver;
    use crate::notify::CallbackNotifier;

    fn device() -> (CameraDevice, crate::device::fake::FakeHandle) {
        let (driver, handle) = FakeDriver::new();
        let tuning = CaptureTuning {
            streaming_buffers: 4,
            snapshot_buffers: 2,
            preview_interval: Duration::ZERO,
        };
        let device = CameraDevice::new(
            Box::new(driver),
            tuning,
            Arc::new(PreviewTarget::new()),
            Arc::new(CallbackNotifier::for_tests()),
            Arc::new(SnapshotSync::new()),
        );
        (device, handle)
    }

    #[test]
    fn lifecycle_walks_the_three_states() {
        let (device, _handle) = device();
        assert_eq!(device.state(), DeviceState::Uninitialized);
        device.connect().unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        device.start(320, 240, PixelFormat::Nv12).unwrap();
        assert_eq!(device.state(), DeviceState::Started);
        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        device.disconnect().unwrap();
        assert_eq!(device.state(), DeviceState::Uninitialized);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let (device, _handle) = device();
        assert!(matches!(
            device.start(320, 240, PixelFormat::Nv12),
            Err(crate::CameraError::InvalidState { .. })
        ));
        assert!(matches!(
            device.stop(),
            Err(crate::CameraError::InvalidState { .. })
        ));

        device.connect().unwrap();
        device.start(320, 240, PixelFormat::Nv12).unwrap();
        assert!(matches!(
            device.start(320, 240, PixelFormat::Nv12),
            Err(crate::CameraError::InvalidState { .. })
        ));
        assert!(matches!(
            device.disconnect(),
            Err(crate::CameraError::InvalidState { .. })
        ));
        device.stop().unwrap();
        device.disconnect().unwrap();
    }

    #[test]
    fn connect_and_stop_are_idempotent_where_legal() {
        let (device, _handle) = device();
        device.connect().unwrap();
        device.connect().unwrap();
        // stop while merely connected is a tolerated no-op
        device.stop().unwrap();
        device.disconnect().unwrap();
        device.disconnect().unwrap();
    }
}
