//! Ownership ledger for the driver's buffer queue.
//!
//! Every buffer is either driver-owned or application-owned; the pool checks
//! the transition on every flip so a bookkeeping bug surfaces as a logged
//! warning instead of corrupting the driver's queue.

use std::io;

use tracing::warn;

use crate::device::driver::DriverFrame;
use crate::device::frame::{BufferIndex, CapturedFrame};
use crate::{CameraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOwner {
    Driver,
    App,
}

pub struct BufferPool {
    slots: Vec<SlotOwner>,
}

impl BufferPool {
    /// A new pool starts with every slot driver-owned, matching a device that
    /// was primed with all buffers queued before stream-on.
    pub fn new(count: u32) -> Self {
        Self {
            slots: vec![SlotOwner::Driver; count as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots currently application-owned.
    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| **s == SlotOwner::App)
            .count()
    }

    /// Record a successful driver dequeue and build the frame descriptor.
    ///
    /// Refuses an index that is out of range or already application-owned (a
    /// double dequeue); the caller skips the frame in that case.
    pub fn acquire(&mut self, raw: DriverFrame, sequence: u64) -> Result<CapturedFrame> {
        let index = raw.index as usize;
        match self.slots.get(index) {
            Some(SlotOwner::Driver) => {
                self.slots[index] = SlotOwner::App;
                Ok(CapturedFrame {
                    index: BufferIndex(raw.index),
                    data: raw.data,
                    timestamp: raw.timestamp,
                    sequence,
                })
            }
            Some(SlotOwner::App) => Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer {index} dequeued twice without release"),
            ))),
            None => Err(CameraError::DriverIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer index {index} out of range (pool of {})", self.len()),
            ))),
        }
    }

    /// Give a slot back. Returns `true` when the slot really was
    /// application-owned; a stray release is a warning no-op so a confused
    /// consumer cannot double-queue a buffer into the driver.
    pub fn release(&mut self, index: BufferIndex) -> bool {
        match self.slots.get(index.0 as usize) {
            Some(SlotOwner::App) => {
                self.slots[index.0 as usize] = SlotOwner::Driver;
                true
            }
            Some(SlotOwner::Driver) => {
                warn!(%index, "release of a buffer the application does not own, ignored");
                false
            }
            None => {
                warn!(%index, "release of an unknown buffer index, ignored");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn raw(index: u32) -> DriverFrame {
        DriverFrame {
            index,
            data: Bytes::from_static(b"frame"),
            timestamp: Duration::from_millis(33),
        }
    }

    #[test]
    fn acquire_then_release_round_trip() {
        let mut pool = BufferPool::new(3);
        let frame = pool.acquire(raw(1), 1).unwrap();
        assert_eq!(frame.index, BufferIndex(1));
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.release(BufferIndex(1)));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn double_dequeue_is_refused() {
        let mut pool = BufferPool::new(2);
        pool.acquire(raw(0), 1).unwrap();
        assert!(pool.acquire(raw(0), 2).is_err());
        // still owned by the app, a single release settles it
        assert!(pool.release(BufferIndex(0)));
    }

    #[test]
    fn stray_release_is_a_no_op() {
        let mut pool = BufferPool::new(2);
        assert!(!pool.release(BufferIndex(0)));
        assert!(!pool.release(BufferIndex(9)));
        // pool still usable afterwards
        pool.acquire(raw(0), 1).unwrap();
        assert!(pool.release(BufferIndex(0)));
        assert!(!pool.release(BufferIndex(0)));
    }
}
