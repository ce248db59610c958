//! Still-image compression dispatch.
//!
//! The pipeline only cares that some encoder turns a captured frame into a
//! JPEG byte stream; whether that happens on a hardware block or in software
//! is behind the trait. The software variant encodes the luma plane —
//! color reconstruction is signal-processing territory, out of scope here.

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use crate::device::frame::{FrameGeometry, PixelFormat};
use crate::{CameraError, Result};

/// Geolocation tag carried into the JPEG metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsTag {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    pub timestamp: i64,
    pub processing_method: String,
}

/// Per-session still-image parameters, refreshed from the parameter string
/// before every take-picture.
#[derive(Debug, Clone)]
pub struct JpegParams {
    pub quality: u8,
    pub rotation: u16,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub gps: Option<GpsTag>,
}

impl Default for JpegParams {
    fn default() -> Self {
        Self {
            quality: 90,
            rotation: 0,
            thumb_width: 0,
            thumb_height: 0,
            gps: None,
        }
    }
}

pub trait JpegEncoder: Send + Sync {
    fn encode(
        &self,
        source: &[u8],
        geometry: &FrameGeometry,
        params: &JpegParams,
    ) -> Result<Vec<u8>>;
}

/// Software fallback encoder used when no hardware block is available.
pub struct SoftJpegEncoder;

impl SoftJpegEncoder {
    fn luma_plane(source: &[u8], geometry: &FrameGeometry) -> Result<Vec<u8>> {
        let pixels = geometry.width as usize * geometry.height as usize;
        match geometry.format {
            PixelFormat::Nv12 => source
                .get(..pixels)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| CameraError::Encode("frame shorter than its luma plane".into())),
            PixelFormat::Yuyv => {
                if source.len() < pixels * 2 {
                    return Err(CameraError::Encode("frame shorter than its luma plane".into()));
                }
                Ok(source.iter().step_by(2).copied().take(pixels).collect())
            }
            PixelFormat::Rgb24 => {
                if source.len() < pixels * 3 {
                    return Err(CameraError::Encode("truncated rgb frame".into()));
                }
                Ok(source
                    .chunks_exact(3)
                    .take(pixels)
                    .map(|px| {
                        // integer BT.601 luma
                        ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8
                    })
                    .collect())
            }
        }
    }
}

impl JpegEncoder for SoftJpegEncoder {
    fn encode(
        &self,
        source: &[u8],
        geometry: &FrameGeometry,
        params: &JpegParams,
    ) -> Result<Vec<u8>> {
        if params.rotation != 0 {
            // the hardware block rotates in-flight; the software fallback
            // leaves orientation to the viewer
            debug!(rotation = params.rotation, "software encoder ignores rotation");
        }
        let luma = Self::luma_plane(source, geometry)?;
        let mut out = Vec::new();
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut out, params.quality);
        encoder
            .encode(&luma, geometry.width, geometry.height, ExtendedColorType::L8)
            .map_err(|err| CameraError::Encode(err.to_string()))?;
        Ok(out)
    }
}
