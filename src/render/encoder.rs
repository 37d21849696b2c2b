use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageEncoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RenderError;
use crate::fits::{ImagePlane, ZScale};
use crate::iiif::{ImageFormat, PixelRegion, PixelSize};

/// JPEG quality used for `jpg` output.
pub const JPEG_QUALITY: u8 = 75;

/// An encoded image written to the generated directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedImage {
    pub file_path: PathBuf,
    /// Lowercase hex SHA-256 of the encoded bytes
    pub sha256: String,
    pub file_size: u64,
}

impl RenderedImage {
    /// Content-addressed object key for this image.
    pub fn object_key(&self) -> String {
        format!("generated/{}", self.sha256)
    }
}

/// Stretch, crop, resize and encode `plane`.
///
/// The region is clipped to the plane; regions produced by the `square`
/// form may extend past the right or bottom edge. A region with no overlap
/// is an error.
pub fn render(
    plane: &ImagePlane,
    region: &PixelRegion,
    size: &PixelSize,
    format: ImageFormat,
) -> Result<Vec<u8>, RenderError> {
    let width = plane.width as u32;
    let height = plane.height as u32;

    let x0 = region.x.min(width);
    let y0 = region.y.min(height);
    let x1 = region.x.saturating_add(region.w).min(width);
    let y1 = region.y.saturating_add(region.h).min(height);
    if x1 <= x0 || y1 <= y0 || size.width == 0 || size.height == 0 {
        return Err(RenderError::EmptyRegion(region.to_string()));
    }

    let pixels = ZScale::default().to_u8(plane);
    let full = GrayImage::from_raw(width, height, pixels)
        .ok_or_else(|| RenderError::Encode("pixel buffer does not match plane".to_string()))?;

    let cropped = imageops::crop_imm(&full, x0, y0, x1 - x0, y1 - y0).to_image();
    let resized = if cropped.dimensions() == (size.width, size.height) {
        cropped
    } else {
        imageops::resize(&cropped, size.width, size.height, FilterType::CatmullRom)
    };

    encode(&resized, format)
}

fn encode(image: &GrayImage, format: ImageFormat) -> Result<Vec<u8>, RenderError> {
    let mut out = Cursor::new(Vec::new());
    let (w, h) = image.dimensions();
    let color = image::ExtendedColorType::L8;

    let result = match format {
        ImageFormat::Png => PngEncoder::new(&mut out).write_image(image.as_raw(), w, h, color),
        ImageFormat::Jpg => JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .write_image(image.as_raw(), w, h, color),
        ImageFormat::Webp => {
            WebPEncoder::new_lossless(&mut out).write_image(image.as_raw(), w, h, color)
        }
    };
    result.map_err(|e| RenderError::Encode(e.to_string()))?;

    Ok(out.into_inner())
}

/// Persist encoded bytes under `dir` with a unique name ending in the
/// format's extension, and digest them.
pub fn write_generated(
    dir: &Path,
    bytes: &[u8],
    format: ImageFormat,
) -> Result<RenderedImage, RenderError> {
    std::fs::create_dir_all(dir).map_err(|e| RenderError::Io(e.to_string()))?;

    let suffix = match format {
        ImageFormat::Jpg => ".jpeg".to_string(),
        other => format!(".{}", other.extension()),
    };
    let mut file = tempfile::Builder::new()
        .prefix("image-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| RenderError::Io(e.to_string()))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|e| RenderError::Io(e.to_string()))?;
    let (_, file_path) = file.keep().map_err(|e| RenderError::Io(e.error.to_string()))?;

    Ok(RenderedImage {
        file_path,
        sha256: hex::encode(Sha256::digest(bytes)),
        file_size: bytes.len() as u64,
    })
}
