//! Handshake between a caller that wants a still picture and the capture
//! loop that owns the frames.
//!
//! Two flags drive it: `prepared` keeps a fresh preview-resolution copy in a
//! double-buffered scratch slot (so a reader never races the writer), and
//! `armed` diverts exactly one captured frame to the snapshot path. A single
//! waiter exists by construction, so the condition variable is deliberately
//! not a broadcast mechanism.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::device::frame::CapturedFrame;
use crate::utils::relock;
use crate::{CameraError, Result};

struct SnapState {
    prepared: bool,
    armed: bool,
    write_slot: usize,
    ready_slot: Option<usize>,
    scratch: [Vec<u8>; 2],
}

pub struct SnapshotSync {
    state: Mutex<SnapState>,
    fresh: Condvar,
}

impl Default for SnapshotSync {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SnapState {
                prepared: false,
                armed: false,
                write_slot: 0,
                ready_slot: None,
                scratch: [Vec::new(), Vec::new()],
            }),
            fresh: Condvar::new(),
        }
    }

    /// Ask the capture loop to start copying frames into the scratch slots.
    pub fn prepare(&self) {
        let mut s = relock(&self.state);
        s.prepared = true;
        s.ready_slot = None;
    }

    pub fn unprepare(&self) {
        relock(&self.state).prepared = false;
    }

    pub fn is_prepared(&self) -> bool {
        relock(&self.state).prepared
    }

    /// Request that the very next captured frame becomes the still picture.
    /// Only one snapshot may be armed at a time.
    pub fn arm(&self) -> Result<()> {
        let mut s = relock(&self.state);
        if s.armed {
            return Err(CameraError::AlreadyArmed);
        }
        s.armed = true;
        s.prepared = false;
        s.ready_slot = None;
        Ok(())
    }

    /// Roll back an arm that could not be serviced (e.g. restart failure).
    pub fn disarm(&self) {
        relock(&self.state).armed = false;
    }

    pub fn is_armed(&self) -> bool {
        relock(&self.state).armed
    }

    /// One-shot consumption of the armed flag by the capture loop.
    pub(crate) fn take_armed(&self) -> bool {
        let mut s = relock(&self.state);
        let was = s.armed;
        s.armed = false;
        was
    }

    /// Capture-loop side: copy the frame into the slot the reader is not
    /// looking at, then signal the waiter.
    pub(crate) fn stash(&self, frame: &CapturedFrame) {
        let mut s = relock(&self.state);
        if !s.prepared {
            return;
        }
        let slot = s.write_slot;
        s.scratch[slot].clear();
        s.scratch[slot].extend_from_slice(&frame.data);
        s.ready_slot = Some(slot);
        s.write_slot = slot ^ 1;
        self.fresh.notify_one();
    }

    /// Caller-thread side: block until one fresh frame has been stashed.
    /// Returns `None` on timeout or when nothing is prepared. Never invoked
    /// from the capture loop itself.
    pub fn wait_prepared_frame(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut s = relock(&self.state);
        loop {
            if let Some(slot) = s.ready_slot {
                return Some(Bytes::copy_from_slice(&s.scratch[slot]));
            }
            if !s.prepared {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .fresh
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            s = guard;
        }
    }
}
