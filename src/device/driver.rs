//! The seam between the capture pipeline and a buffer-queue capture driver.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::device::frame::{FrameGeometry, PixelFormat};
use crate::Result;

/// Identity reported by the driver at connect time.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub card: String,
    pub driver: String,
}

/// Format the caller asks for; the driver answers with what it can do.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued without blocking.
    Frame,
    /// Nothing arrived within the timeout; the loop retries.
    TimedOut,
    /// The waker fired; the loop must exit.
    Cancelled,
}

/// A filled buffer as handed over by the driver.
#[derive(Debug)]
pub struct DriverFrame {
    pub index: u32,
    pub data: Bytes,
    pub timestamp: Duration,
}

/// Wakes a capture loop blocked in [`CaptureDriver::wait_frame`].
///
/// Obtained before the driver moves into the capture thread, so `stop()` can
/// signal the loop from a caller thread.
#[derive(Clone)]
pub struct LoopWaker(Arc<dyn Fn() + Send + Sync>);

impl LoopWaker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for LoopWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopWaker")
    }
}

/// Abstract buffer-queue capture device.
///
/// Ownership rules: a buffer the driver has filled becomes application-owned
/// via `dequeue` and goes back driver-owned via `requeue`. The capture loop is
/// the only caller of `wait_frame`/`dequeue`/`requeue` while streaming.
pub trait CaptureDriver: Send {
    /// Open the device node and probe capabilities.
    fn open(&mut self) -> Result<DriverInfo>;

    /// Close the device node. Never fails; errors on close are logged.
    fn close(&mut self);

    /// Negotiate resolution and pixel format. The driver may substitute a
    /// nearby supported size; the returned geometry is authoritative.
    fn negotiate(&mut self, request: &FormatRequest) -> Result<FrameGeometry>;

    /// Allocate and prime `buffers` driver-owned buffers, then start
    /// streaming. Returns the count actually granted.
    fn stream_on(&mut self, buffers: u32) -> Result<u32>;

    /// Stop streaming and tear down the buffers. Must be called only after
    /// the capture loop has been joined.
    fn stream_off(&mut self) -> Result<()>;

    /// Wait up to `timeout` for a filled buffer or a waker signal.
    fn wait_frame(&mut self, timeout: Duration) -> Result<Readiness>;

    /// Non-blocking dequeue of one filled buffer.
    fn dequeue(&mut self) -> Result<DriverFrame>;

    /// Give a buffer back to the driver.
    fn requeue(&mut self, index: u32) -> Result<()>;

    /// Handle that can interrupt `wait_frame` from another thread.
    fn waker(&self) -> LoopWaker;
}
