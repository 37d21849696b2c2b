//! Full image requests: region, size, rotation, quality and format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::info::ImageInfo;
use super::region::{PixelRegion, Region};
use super::size::{PixelSize, Size};
use crate::error::IiifError;

/// Output formats the server can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Webp,
    Png,
    Jpg,
}

impl ImageFormat {
    /// Extension as it appears in request paths.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Webp => "webp",
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Webp => "image/webp",
            ImageFormat::Png => "image/png",
            ImageFormat::Jpg => "image/jpeg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = IiifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webp" => Ok(ImageFormat::Webp),
            "png" => Ok(ImageFormat::Png),
            "jpg" => Ok(ImageFormat::Jpg),
            other => Err(IiifError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Rotation segment. Only the identity rotation is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0")
    }
}

impl FromStr for Rotation {
    type Err = IiifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Rotation::None),
            other => Err(IiifError::UnsupportedRotation(other.to_string())),
        }
    }
}

/// Quality segment. Only `default` is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Default,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("default")
    }
}

impl FromStr for Quality {
    type Err = IiifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Quality::Default),
            other => Err(IiifError::UnsupportedQuality(other.to_string())),
        }
    }
}

/// A parsed `{region}/{size}/{rotation}/{quality}.{format}` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRequest {
    pub region: Region,
    pub size: Size,
    pub rotation: Rotation,
    pub quality: Quality,
    pub format: ImageFormat,
}

impl ImageRequest {
    /// Parse the four trailing path segments. `quality_format` is `{quality}.{format}`.
    pub fn parse(
        region: &str,
        size: &str,
        rotation: &str,
        quality_format: &str,
    ) -> Result<Self, IiifError> {
        let (quality, format) = quality_format
            .rsplit_once('.')
            .ok_or_else(|| IiifError::UnsupportedFormat(quality_format.to_string()))?;

        Ok(Self {
            region: region.parse()?,
            size: size.parse()?,
            rotation: rotation.parse()?,
            quality: quality.parse()?,
            format: format.parse()?,
        })
    }

    /// Normalize region then size against `info`.
    pub fn normalize(&self, info: &ImageInfo) -> Result<NormalizedRequest, IiifError> {
        let region = self.region.normalize(info.width, info.height)?;
        let size = self.size.normalize(&region, info)?;
        Ok(NormalizedRequest {
            region,
            size,
            rotation: self.rotation,
            quality: self.quality,
            format: self.format,
        })
    }
}

/// A request resolved to exact pixel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub region: PixelRegion,
    pub size: PixelSize,
    pub rotation: Rotation,
    pub quality: Quality,
    pub format: ImageFormat,
}

impl fmt::Display for NormalizedRequest {
    /// Canonical form: `x,y,w,h/w,h/rotation/quality.format`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.region, self.size, self.rotation, self.quality, self.format
        )
    }
}
