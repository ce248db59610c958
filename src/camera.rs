//! Public facade tying the device state machine, the preview surface, the
//! snapshot handshake and the callback notifier together.
//!
//! The host talks to this type only. Session settings travel as a flat
//! `key=value;key=value` parameter string, the one wire format every host
//! already speaks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::driver::CaptureDriver;
use crate::device::frame::PixelFormat;
use crate::device::{CameraDevice, CaptureTuning, DeviceState};
use crate::notify::jpeg::{GpsTag, JpegEncoder, JpegParams};
use crate::notify::{CallbackNotifier, CameraCallbacks, HostAllocator, MessageMask};
use crate::pipeline::snapshot::SnapshotSync;
use crate::preview::{PreviewSink, PreviewTarget};
use crate::utils::relock;
use crate::{CameraError, Config, Result};

/// How long take-picture waits for one fresh preview-resolution frame before
/// restarting the stream anyway.
const PREPARED_FRAME_WAIT: Duration = Duration::from_secs(1);

pub const KEY_PREVIEW_SIZE: &str = "preview-size";
pub const KEY_PICTURE_SIZE: &str = "picture-size";
pub const KEY_JPEG_QUALITY: &str = "jpeg-quality";
pub const KEY_ROTATION: &str = "rotation";
pub const KEY_THUMB_WIDTH: &str = "jpeg-thumbnail-width";
pub const KEY_THUMB_HEIGHT: &str = "jpeg-thumbnail-height";
pub const KEY_GPS_LATITUDE: &str = "gps-latitude";
pub const KEY_GPS_LONGITUDE: &str = "gps-longitude";
pub const KEY_GPS_ALTITUDE: &str = "gps-altitude";
pub const KEY_GPS_TIMESTAMP: &str = "gps-timestamp";
pub const KEY_GPS_METHOD: &str = "gps-processing-method";

pub struct Camera {
    device: CameraDevice,
    preview: Arc<PreviewTarget>,
    notifier: Arc<CallbackNotifier>,
    snapshot: Arc<SnapshotSync>,
    params: Mutex<BTreeMap<String, String>>,
    format: PixelFormat,
}

impl Camera {
    pub fn new(driver: Box<dyn CaptureDriver>, encoder: Box<dyn JpegEncoder>, config: &Config) -> Self {
        let preview = Arc::new(PreviewTarget::new());
        let notifier = Arc::new(CallbackNotifier::new(encoder));
        let snapshot = Arc::new(SnapshotSync::new());
        let device = CameraDevice::new(
            driver,
            CaptureTuning::from_config(config),
            preview.clone(),
            notifier.clone(),
            snapshot.clone(),
        );

        let mut params = BTreeMap::new();
        params.insert(
            KEY_PREVIEW_SIZE.into(),
            format!("{}x{}", config.capture.width, config.capture.height),
        );
        params.insert(
            KEY_PICTURE_SIZE.into(),
            format!("{}x{}", config.snapshot.width, config.snapshot.height),
        );
        params.insert(KEY_JPEG_QUALITY.into(), "90".into());
        params.insert(KEY_ROTATION.into(), "0".into());

        Self {
            device,
            preview,
            notifier,
            snapshot,
            params: Mutex::new(params),
            format: config.capture.format,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn connect(&self) -> Result<()> {
        self.device.connect()
    }

    /// Tear the whole session down: preview off, device closed, every
    /// host-facing registration dropped.
    pub fn disconnect(&self) -> Result<()> {
        self.notifier.disable_recording();
        self.stop_preview()?;
        self.snapshot.unprepare();
        self.snapshot.disarm();
        self.device.disconnect()?;
        self.notifier.cleanup();
        Ok(())
    }

    pub fn set_preview_sink(&self, sink: Option<Box<dyn PreviewSink>>) {
        self.preview.set_sink(sink);
    }

    pub fn show_preview(&self) {
        self.preview.show();
    }

    pub fn hide_preview(&self) {
        self.preview.hide();
    }

    pub fn start_preview(&self) -> Result<()> {
        self.preview.enable();
        if self.device.state() != DeviceState::Started {
            let (width, height) = self.preview_size();
            self.device.start(width, height, self.format)?;
        }
        Ok(())
    }

    /// Disable the preview surface and, when nothing else needs frames, stop
    /// the stream.
    pub fn stop_preview(&self) -> Result<()> {
        self.preview.disable();
        if self.device.state() == DeviceState::Started && !self.notifier.is_recording() {
            self.device.stop()?;
        }
        Ok(())
    }

    pub fn start_recording(&self) -> Result<()> {
        self.notifier.enable_recording();
        if self.device.state() != DeviceState::Started {
            let (width, height) = self.preview_size();
            self.device.start(width, height, self.format)?;
        }
        info!("recording enabled");
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.notifier.disable_recording();
        if self.device.state() == DeviceState::Started && !self.preview.is_enabled() {
            self.device.stop()?;
        }
        Ok(())
    }

    /// One still picture: wait for a fresh frame at the current size, then
    /// restart the stream at picture resolution with the snapshot armed. The
    /// next captured frame comes back through the snapshot callbacks.
    pub fn take_picture(&self) -> Result<()> {
        if self.device.state() != DeviceState::Started {
            return Err(CameraError::invalid_state("take-picture", self.device.state()));
        }
        self.notifier.set_jpeg_params(self.jpeg_params());

        // the last live frame doubles as the user's "what the shot looked
        // like" reference while the stream restarts
        self.snapshot.prepare();
        if self
            .snapshot
            .wait_prepared_frame(PREPARED_FRAME_WAIT)
            .is_none()
        {
            warn!("no fresh frame before restart, continuing anyway");
        }
        self.snapshot.unprepare();

        self.snapshot.arm()?;
        if let Err(err) = self.device.stop() {
            // the arm cannot be serviced, roll it back so the next
            // take-picture is not refused as already armed
            self.snapshot.disarm();
            return Err(err);
        }

        let (width, height) = self.picture_size();
        if let Err(err) = self.device.start(width, height, self.format) {
            self.snapshot.disarm();
            return Err(err);
        }
        debug!(width, height, "stream restarted for still capture");
        Ok(())
    }

    /// Fixed-focus module: report success as soon as the host asks.
    pub fn auto_focus(&self) -> Result<()> {
        self.notifier.on_auto_focus(true);
        Ok(())
    }

    pub fn cancel_auto_focus(&self) -> Result<()> {
        Ok(())
    }

    pub fn set_callbacks(&self, callbacks: CameraCallbacks, allocator: Arc<dyn HostAllocator>) {
        self.notifier.set_callbacks(callbacks, allocator);
    }

    pub fn enable_message(&self, messages: MessageMask) {
        self.notifier.enable_message(messages);
    }

    pub fn disable_message(&self, messages: MessageMask) {
        self.notifier.disable_message(messages);
    }

    pub fn is_message_enabled(&self, messages: MessageMask) -> bool {
        self.notifier.is_message_enabled(messages)
    }

    /// Merge a `key=value;key=value` string into the session parameters.
    /// Unknown keys are stored and echoed back untouched.
    pub fn set_parameters(&self, flat: &str) -> Result<()> {
        let mut params = relock(&self.params);
        for pair in flat.split(';').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((key, value)) => {
                    params.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    return Err(CameraError::UnsupportedFormat(format!(
                        "malformed parameter pair {pair:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get_parameters(&self) -> String {
        let params = relock(&self.params);
        let mut flat = String::new();
        for (key, value) in params.iter() {
            if !flat.is_empty() {
                flat.push(';');
            }
            flat.push_str(key);
            flat.push('=');
            flat.push_str(value);
        }
        flat
    }

    fn param(&self, key: &str) -> Option<String> {
        relock(&self.params).get(key).cloned()
    }

    fn size_param(&self, key: &str, fallback: (u32, u32)) -> (u32, u32) {
        self.param(key)
            .and_then(|v| parse_size(&v))
            .unwrap_or(fallback)
    }

    fn preview_size(&self) -> (u32, u32) {
        let config = crate::CONFIG.load();
        self.size_param(
            KEY_PREVIEW_SIZE,
            (config.capture.width, config.capture.height),
        )
    }

    fn picture_size(&self) -> (u32, u32) {
        let config = crate::CONFIG.load();
        self.size_param(
            KEY_PICTURE_SIZE,
            (config.snapshot.width, config.snapshot.height),
        )
    }

    fn jpeg_params(&self) -> JpegParams {
        let params = relock(&self.params);
        let get = |key: &str| params.get(key);
        let gps = match (
            get(KEY_GPS_LATITUDE).and_then(|v| v.parse::<f64>().ok()),
            get(KEY_GPS_LONGITUDE).and_then(|v| v.parse::<f64>().ok()),
        ) {
            (Some(latitude), Some(longitude)) => Some(GpsTag {
                latitude,
                longitude,
                altitude: get(KEY_GPS_ALTITUDE)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                timestamp: get(KEY_GPS_TIMESTAMP)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                processing_method: get(KEY_GPS_METHOD).cloned().unwrap_or_default(),
            }),
            _ => None,
        };
        JpegParams {
            quality: get(KEY_JPEG_QUALITY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            rotation: get(KEY_ROTATION).and_then(|v| v.parse().ok()).unwrap_or(0),
            thumb_width: get(KEY_THUMB_WIDTH)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            thumb_height: get(KEY_THUMB_HEIGHT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            gps,
        }
    }
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDriver;
    use crate::notify::jpeg::SoftJpegEncoder;

    fn camera() -> Camera {
        let (driver, _handle) = FakeDriver::new();
        Camera::new(
            Box::new(driver),
            Box::new(SoftJpegEncoder),
            &Config::default(),
        )
    }

    #[test]
    fn parameters_round_trip_and_merge() {
        let camera = camera();
        camera
            .set_parameters("picture-size=640x480;jpeg-quality=75")
            .unwrap();
        let flat = camera.get_parameters();
        assert!(flat.contains("picture-size=640x480"));
        assert!(flat.contains("jpeg-quality=75"));
        // defaults installed at construction survive the merge
        assert!(flat.contains("preview-size=800x600"));
    }

    #[test]
    fn malformed_parameter_pair_is_refused() {
        let camera = camera();
        assert!(matches!(
            camera.set_parameters("rotation"),
            Err(CameraError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn jpeg_params_are_read_from_the_string() {
        let camera = camera();
        camera
            .set_parameters(
                "jpeg-quality=60;rotation=90;gps-latitude=48.8;gps-longitude=2.35;gps-altitude=35",
            )
            .unwrap();
        let params = camera.jpeg_params();
        assert_eq!(params.quality, 60);
        assert_eq!(params.rotation, 90);
        let gps = params.gps.expect("gps tag present");
        assert_eq!(gps.altitude, 35);
    }

    #[test]
    fn take_picture_requires_a_started_device() {
        let camera = camera();
        assert!(matches!(
            camera.take_picture(),
            Err(CameraError::InvalidState { .. })
        ));
    }

    #[test]
    fn parse_size_accepts_wxh_only() {
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size("640*480"), None);
        assert_eq!(parse_size("x480"), None);
    }
}
