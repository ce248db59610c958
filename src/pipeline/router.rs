//! Per-frame routing decisions.
//!
//! The delivery strategy is picked once when the device starts: shared
//! descriptors if the attached surface can take them, otherwise one copy per
//! frame into a working buffer that every consumer reads. A shared-path
//! delivery failure downgrades to the copied path for the rest of the
//! session; it is a one-way transition.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::frame::{CapturedFrame, FrameGeometry};
use crate::notify::CallbackNotifier;
use crate::preview::{PreviewError, PreviewTarget, SharedFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Pass the capture buffer view straight to the consumers.
    Shared,
    /// Copy once into a process-owned working buffer, then fan out.
    Copied,
}

pub struct FrameRouter {
    path: DeliveryPath,
    preview: Arc<PreviewTarget>,
    preview_interval: Duration,
    last_previewed: Option<Duration>,
    geometry: FrameGeometry,
    working: Vec<u8>,
}

impl FrameRouter {
    pub fn new(
        preview: Arc<PreviewTarget>,
        geometry: FrameGeometry,
        preview_interval: Duration,
    ) -> Self {
        let path = if preview.supports_shared() {
            DeliveryPath::Shared
        } else {
            DeliveryPath::Copied
        };
        debug!(?path, ?preview_interval, "delivery strategy selected");
        Self {
            path,
            preview,
            preview_interval,
            last_previewed: None,
            geometry,
            working: Vec::new(),
        }
    }

    pub fn path(&self) -> DeliveryPath {
        self.path
    }

    /// Deliver one frame to the preview surface and the callback consumers.
    /// Never blocks beyond a copy; the caller releases the frame afterwards
    /// whatever happened here.
    pub fn route(&mut self, frame: &CapturedFrame, notifier: &CallbackNotifier) {
        match self.path {
            DeliveryPath::Shared => self.route_shared(frame, notifier),
            DeliveryPath::Copied => self.route_copied(frame, notifier),
        }
    }

    fn route_shared(&mut self, frame: &CapturedFrame, notifier: &CallbackNotifier) {
        if self.preview.is_enabled() && self.preview_due(frame.timestamp) {
            let shared = SharedFrame {
                data: frame.data.clone(),
                geometry: self.geometry,
                timestamp: frame.timestamp,
                source: frame.index,
            };
            match self.preview.render_shared(&shared) {
                Ok(()) => self.mark_previewed(frame.timestamp),
                Err(PreviewError::Busy) => {
                    // the pacing window stays open so the next frame gets a
                    // fresh attempt
                    debug!(index = %frame.index, "preview surface busy, frame skipped");
                }
                Err(PreviewError::Rejected(reason)) => {
                    warn!(%reason, "shared preview path failed, switching to copied path");
                    self.path = DeliveryPath::Copied;
                }
            }
        }
        // the callback consumers still see this frame, even when the preview
        // surface just failed
        notifier.on_video_frame(&frame.data, frame.timestamp);
        notifier.on_preview_frame(&frame.data);
    }

    fn route_copied(&mut self, frame: &CapturedFrame, notifier: &CallbackNotifier) {
        // one copy, amortized across every consumer below
        self.working.clear();
        self.working.extend_from_slice(&frame.data);

        if self.preview.is_enabled() && self.preview_due(frame.timestamp) {
            match self
                .preview
                .render_copied(&self.working, &self.geometry, frame.timestamp)
            {
                Ok(()) => self.mark_previewed(frame.timestamp),
                Err(err) => {
                    debug!(%err, index = %frame.index, "copied preview delivery failed");
                }
            }
        }
        notifier.on_video_frame(&self.working, frame.timestamp);
        notifier.on_preview_frame(&self.working);
    }

    /// Preview pacing against capture timestamps. Dropping here only skips
    /// the surface; release and callback delivery are unaffected. The window
    /// is consumed by [`Self::mark_previewed`] on successful delivery only,
    /// so a busy surface does not push the next attempt out by a full
    /// interval.
    fn preview_due(&self, timestamp: Duration) -> bool {
        match self.last_previewed {
            Some(last) => timestamp >= last + self.preview_interval,
            None => true,
        }
    }

    fn mark_previewed(&mut self, timestamp: Duration) {
        self.last_previewed = Some(timestamp);
    }
}
