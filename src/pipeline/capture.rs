//! The dedicated capture loop.
//!
//! One thread per started device: wait for readiness, dequeue, hand the frame
//! to the snapshot handshake or the router, release. Per-frame failures are
//! absorbed here; the loop only exits on cancellation. The device owner joins
//! this thread before it tears the stream down, which is what makes buffer
//! unmapping safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::device::driver::{CaptureDriver, Readiness};
use crate::device::frame::FrameGeometry;
use crate::device::pool::BufferPool;
use crate::notify::{CallbackNotifier, ERROR_UNKNOWN};
use crate::pipeline::router::FrameRouter;
use crate::pipeline::snapshot::SnapshotSync;

/// Upper bound on one readiness wait; a stalled driver surfaces as a logged
/// timeout instead of an unbounded block.
const SELECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Breather after repeated dequeue failures, so a wedged driver does not spin
/// the loop at full speed.
const IO_BACKOFF: Duration = Duration::from_millis(20);

const MAX_IO_STRIKES: u32 = 3;

pub struct CaptureWorker {
    driver: Box<dyn CaptureDriver>,
    pool: BufferPool,
    router: FrameRouter,
    notifier: Arc<CallbackNotifier>,
    snapshot: Arc<SnapshotSync>,
    cancel: Arc<AtomicBool>,
    geometry: FrameGeometry,
    sequence: u64,
    last_timestamp: Duration,
}

impl CaptureWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Box<dyn CaptureDriver>,
        pool: BufferPool,
        router: FrameRouter,
        notifier: Arc<CallbackNotifier>,
        snapshot: Arc<SnapshotSync>,
        cancel: Arc<AtomicBool>,
        geometry: FrameGeometry,
    ) -> Self {
        Self {
            driver,
            pool,
            router,
            notifier,
            snapshot,
            cancel,
            geometry,
            sequence: 0,
            last_timestamp: Duration::ZERO,
        }
    }

    /// Run until cancelled, then hand the driver back so the owner can stop
    /// the stream on its own thread.
    pub fn run(mut self) -> Box<dyn CaptureDriver> {
        info!(geometry = ?self.geometry, buffers = self.pool.len(), "capture loop running");
        let mut strikes = 0u32;

        while !self.cancel.load(Ordering::Acquire) {
            match self.driver.wait_frame(SELECT_TIMEOUT) {
                Ok(Readiness::Cancelled) => break,
                Ok(Readiness::TimedOut) => {
                    warn!(timeout = ?SELECT_TIMEOUT, "no frame within the readiness window");
                    continue;
                }
                Ok(Readiness::Frame) => {}
                Err(err) => {
                    warn!(%err, "readiness wait failed");
                    strikes += 1;
                    if strikes >= MAX_IO_STRIKES {
                        self.notifier.on_device_error(ERROR_UNKNOWN);
                        std::thread::sleep(IO_BACKOFF);
                    }
                    continue;
                }
            }

            match self.driver.dequeue() {
                Ok(raw) => {
                    strikes = 0;
                    self.handle_frame(raw);
                }
                Err(err) => {
                    warn!(%err, "dequeue failed");
                    strikes += 1;
                    if strikes >= MAX_IO_STRIKES {
                        self.notifier.on_device_error(ERROR_UNKNOWN);
                        std::thread::sleep(IO_BACKOFF);
                    }
                }
            }
        }

        if self.pool.outstanding() != 0 {
            warn!(
                outstanding = self.pool.outstanding(),
                "capture loop exits with application-owned buffers"
            );
        }
        info!(frames = self.sequence, "capture loop stopped");
        self.driver
    }

    fn handle_frame(&mut self, mut raw: crate::device::driver::DriverFrame) {
        // driver clocks have been seen stepping backwards across restarts
        if raw.timestamp < self.last_timestamp {
            trace!(ts = ?raw.timestamp, last = ?self.last_timestamp, "clamping timestamp");
            raw.timestamp = self.last_timestamp;
        }
        self.last_timestamp = raw.timestamp;
        self.sequence += 1;

        let index = raw.index;
        let frame = match self.pool.acquire(raw, self.sequence) {
            Ok(frame) => frame,
            Err(err) => {
                // bookkeeping refused the dequeue; skipping is the safe move,
                // requeueing a slot we may not own is not
                warn!(%err, "frame dropped by the ownership ledger");
                return;
            }
        };

        if self.snapshot.take_armed() {
            debug!(index = %frame.index, "frame diverted to the snapshot path");
            self.notifier.on_snapshot(&frame, &self.geometry);
        } else {
            self.snapshot.stash(&frame);
            self.router.route(&frame, &self.notifier);
        }

        if self.pool.release(frame.index) {
            if let Err(err) = self.driver.requeue(index) {
                warn!(%err, index, "requeue failed, slot stays out of rotation");
            }
        }
    }
}
