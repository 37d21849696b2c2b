//! IIIF region parsing and normalization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::round_half_even;
use crate::error::IiifError;

/// The rectangular crop requested by a client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region {
    /// The whole image
    Full,
    /// A square of side `min(width, height)`
    Square,
    /// Percentages of the image dimensions
    Percent { x: f64, y: f64, w: f64, h: f64 },
    /// Absolute pixel coordinates
    Pixel { x: u32, y: u32, w: u32, h: u32 },
}

/// An absolute pixel rectangle, rendered canonically as `x,y,w,h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRegion {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Width over height.
    pub fn aspect_ratio(&self) -> f64 {
        self.w as f64 / self.h as f64
    }
}

impl fmt::Display for PixelRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.w, self.h)
    }
}

impl Region {
    /// Resolve this region against an image of `width` x `height` pixels.
    ///
    /// `Square` is anchored at `(width / 2, height / 2)`, so the box usually
    /// extends past the right or bottom edge. Renderers clip it; it is not
    /// treated as an error. Only an origin beyond the image bounds fails.
    pub fn normalize(&self, width: u32, height: u32) -> Result<PixelRegion, IiifError> {
        let region = match *self {
            Region::Full => PixelRegion::new(0, 0, width, height),
            Region::Square => {
                let side = width.min(height);
                PixelRegion::new(width / 2, height / 2, side, side)
            }
            Region::Percent { x, y, w, h } => PixelRegion::new(
                percent_of(width, x),
                percent_of(height, y),
                percent_of(width, w).max(1),
                percent_of(height, h).max(1),
            ),
            Region::Pixel { x, y, w, h } => PixelRegion::new(x, y, w, h),
        };

        if region.x > width || region.y > height {
            return Err(IiifError::RegionOutOfBounds {
                x: region.x,
                y: region.y,
                width,
                height,
            });
        }

        Ok(region)
    }
}

fn percent_of(dimension: u32, percent: f64) -> u32 {
    round_half_even(dimension as f64 * percent / 100.0)
}

impl FromStr for Region {
    type Err = IiifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IiifError::InvalidRegion(s.to_string());

        match s {
            "full" => return Ok(Region::Full),
            "square" => return Ok(Region::Square),
            _ => {}
        }

        if let Some(rest) = s.strip_prefix("pct:") {
            let [x, y, w, h] = split_four(rest, |v| v.parse::<f64>().ok()).ok_or_else(invalid)?;
            let finite = [x, y, w, h].iter().all(|v| v.is_finite());
            if !finite || x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
                return Err(invalid());
            }
            return Ok(Region::Percent { x, y, w, h });
        }

        let [x, y, w, h] = split_four(s, |v| v.parse::<u32>().ok()).ok_or_else(invalid)?;
        if w == 0 || h == 0 {
            return Err(invalid());
        }
        Ok(Region::Pixel { x, y, w, h })
    }
}

fn split_four<T: Copy>(s: &str, parse: impl Fn(&str) -> Option<T>) -> Option<[T; 4]> {
    let mut parts = s.split(',');
    let values = [
        parse(parts.next()?)?,
        parse(parts.next()?)?,
        parse(parts.next()?)?,
        parse(parts.next()?)?,
    ];
    if parts.next().is_some() {
        return None;
    }
    Some(values)
}
