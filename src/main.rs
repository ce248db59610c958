//! Helios capture demo: preview frames over a channel, one still picture on
//! Ctrl-C.

use std::sync::Arc;

use color_eyre::Result;
use tracing::{info, warn};

use helios::device::fake::FakeDriver;
use helios::device::v4l2::V4l2Driver;
use helios::notify::jpeg::SoftJpegEncoder;
use helios::notify::{CameraCallbacks, HeapAllocator, MessageMask};
use helios::preview::ChannelPreview;
use helios::{utils, Camera, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("helios=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Helios launching...");

    // Load configuration: defaults, then helios.toml, then HELIOS_* env vars
    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("helios").required(false))
        .add_source(config::Environment::with_prefix("HELIOS").separator("__"))
        .build()?
        .try_deserialize()
        .unwrap_or_default();
    helios::CONFIG.store(Arc::new(config.clone()));

    // Pick a driver: configured node, auto-detected node, emulated fallback
    let camera = if !config.capture.device.is_empty() {
        info!(path = %config.capture.device, "using configured capture device");
        Camera::new(
            Box::new(V4l2Driver::new(&config.capture.device)?),
            Box::new(SoftJpegEncoder),
            &config,
        )
    } else if let Some(found) = utils::auto_detect_device() {
        info!(path = %found.path, format = ?found.format, "using detected capture device");
        let mut config = config.clone();
        config.capture.format = found.format;
        Camera::new(
            Box::new(V4l2Driver::new(&found.path)?),
            Box::new(SoftJpegEncoder),
            &config,
        )
    } else {
        warn!("no capture device found, using the emulated sensor");
        Camera::new(
            Box::new(FakeDriver::paced(config.capture.fps)),
            Box::new(SoftJpegEncoder),
            &config,
        )
    };

    camera.set_callbacks(
        CameraCallbacks {
            notify: Box::new(|msg, a, b| info!(?msg, a, b, "notify")),
            data: Box::new(|msg, mem| info!(?msg, bytes = mem.len(), "data")),
            data_timestamp: Box::new(|ts, msg, mem| {
                info!(?msg, ?ts, bytes = mem.len(), "data with timestamp")
            }),
        },
        Arc::new(HeapAllocator),
    );
    camera.enable_message(
        MessageMask::ERROR
            | MessageMask::SHUTTER
            | MessageMask::COMPRESSED_IMAGE
            | MessageMask::FOCUS,
    );

    let (sink, frames) = ChannelPreview::new(4);
    camera.set_preview_sink(Some(Box::new(sink)));

    camera.connect()?;
    camera.start_preview()?;

    // Drain the preview channel until shutdown
    let preview_task = tokio::spawn(async move {
        let mut seen = 0u64;
        while let Ok(frame) = frames.recv_async().await {
            seen += 1;
            if seen % 30 == 0 {
                info!(
                    seen,
                    width = frame.width,
                    height = frame.height,
                    ts = ?frame.timestamp,
                    "preview frames flowing"
                );
            }
        }
        info!(seen, "preview channel closed");
    });

    tokio::signal::ctrl_c().await?;
    info!("taking one picture before shutdown");
    if let Err(err) = camera.take_picture() {
        warn!(%err, "still capture failed");
    }
    // leave the restarted stream a moment to deliver the armed frame
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    camera.stop_preview()?;
    camera.disconnect()?;
    preview_task.abort();

    info!("Helios shutting down");
    Ok(())
}
