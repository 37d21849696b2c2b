//! IIIF size parsing and normalization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::info::ImageInfo;
use super::region::PixelRegion;
use super::round_half_even;
use crate::error::{IiifError, SizeConstraintViolation};

/// The size forms of the IIIF grammar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeKind {
    /// `max`
    Max,
    /// `w,`
    FixedWidth(u32),
    /// `,h`
    FixedHeight(u32),
    /// `pct:n`
    Percent(f64),
    /// `w,h`
    Pixel { w: u32, h: u32 },
    /// `!w,h`
    PreservedAspect { w: u32, h: u32 },
}

/// A requested output size. `upscaleable` records a leading `^`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub kind: SizeKind,
    pub upscaleable: bool,
}

/// Output dimensions in pixels, rendered canonically as `w,h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.width, self.height)
    }
}

impl Size {
    pub fn new(kind: SizeKind) -> Self {
        Self {
            kind,
            upscaleable: false,
        }
    }

    /// Resolve this size against an already normalized region.
    ///
    /// `Max` yields `max(region, server limit)` per axis, which exceeds the
    /// region whenever a server limit is larger than it; the validation below
    /// then rejects it.
    pub fn normalize(
        &self,
        region: &PixelRegion,
        info: &ImageInfo,
    ) -> Result<PixelSize, IiifError> {
        if self.upscaleable {
            return Err(IiifError::UpscalingUnsupported);
        }

        let aspect = region.aspect_ratio();
        let from_width = |w: u32| PixelSize::new(w, round_half_even(w as f64 / aspect));
        let from_height = |h: u32| PixelSize::new(round_half_even(h as f64 * aspect), h);

        let size = match self.kind {
            SizeKind::Max => PixelSize::new(
                region.w.max(info.max_width.unwrap_or(0)),
                region.h.max(info.effective_max_height().unwrap_or(0)),
            ),
            SizeKind::FixedWidth(w) => from_width(w),
            SizeKind::FixedHeight(h) => from_height(h),
            SizeKind::Percent(n) => PixelSize::new(
                round_half_even(region.w as f64 * n / 100.0),
                round_half_even(region.h as f64 * n / 100.0),
            ),
            SizeKind::Pixel { w, h } => PixelSize::new(w, h),
            SizeKind::PreservedAspect { w, h } => {
                let cap_w = cap(w, region.w, info.max_width);
                let cap_h = cap(h, region.h, info.effective_max_height());
                let by_width = from_width(cap_w);
                let by_height = from_height(cap_h);

                // A candidate that does not fit the requested box is not a
                // valid `!w,h` answer; otherwise the larger area wins.
                let fits = |c: &PixelSize| c.width <= w && c.height <= h;
                match (fits(&by_width), fits(&by_height)) {
                    (true, false) => by_width,
                    (false, true) => by_height,
                    _ if by_height.area() > by_width.area() => by_height,
                    _ => by_width,
                }
            }
        };

        validate(size, region, info)?;
        Ok(size)
    }
}

fn cap(requested: u32, region: u32, limit: Option<u32>) -> u32 {
    let capped = requested.min(region);
    match limit {
        Some(limit) => capped.min(limit),
        None => capped,
    }
}

fn validate(size: PixelSize, region: &PixelRegion, info: &ImageInfo) -> Result<(), IiifError> {
    if size.width > region.w {
        return Err(SizeConstraintViolation::RegionWidth {
            width: size.width,
            limit: region.w,
        }
        .into());
    }
    if size.height > region.h {
        return Err(SizeConstraintViolation::RegionHeight {
            height: size.height,
            limit: region.h,
        }
        .into());
    }
    if let Some(limit) = info.max_width {
        if size.width > limit {
            return Err(SizeConstraintViolation::MaxWidth {
                width: size.width,
                limit,
            }
            .into());
        }
    }
    if let Some(limit) = info.effective_max_height() {
        if size.height > limit {
            return Err(SizeConstraintViolation::MaxHeight {
                height: size.height,
                limit,
            }
            .into());
        }
    }
    if let Some(limit) = info.max_area {
        if size.area() > limit {
            return Err(SizeConstraintViolation::MaxArea {
                area: size.area(),
                limit,
            }
            .into());
        }
    }
    if size.width == 0 || size.height == 0 {
        return Err(SizeConstraintViolation::Empty {
            width: size.width,
            height: size.height,
        }
        .into());
    }
    Ok(())
}

impl FromStr for Size {
    type Err = IiifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IiifError::InvalidSize(s.to_string());

        let (upscaleable, body) = match s.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let kind = if body == "max" {
            SizeKind::Max
        } else if let Some(n) = body.strip_prefix("pct:") {
            let n: f64 = n.parse().map_err(|_| invalid())?;
            // Above 100% is only expressible with `^`
            if !n.is_finite() || n <= 0.0 || (n > 100.0 && !upscaleable) {
                return Err(invalid());
            }
            SizeKind::Percent(n)
        } else if let Some(pair) = body.strip_prefix('!') {
            let (w, h) = parse_pair(pair).ok_or_else(invalid)?;
            SizeKind::PreservedAspect {
                w: w.ok_or_else(invalid)?,
                h: h.ok_or_else(invalid)?,
            }
        } else {
            match parse_pair(body).ok_or_else(invalid)? {
                (Some(w), Some(h)) => SizeKind::Pixel { w, h },
                (Some(w), None) => SizeKind::FixedWidth(w),
                (None, Some(h)) => SizeKind::FixedHeight(h),
                (None, None) => return Err(invalid()),
            }
        };

        Ok(Size { kind, upscaleable })
    }
}

/// Parse `w,h` where either side may be empty. Zero is never valid.
fn parse_pair(s: &str) -> Option<(Option<u32>, Option<u32>)> {
    let (w, h) = s.split_once(',')?;
    let side = |v: &str| -> Option<Option<u32>> {
        if v.is_empty() {
            return Some(None);
        }
        match v.parse::<u32>() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(Some(n)),
        }
    };
    Some((side(w)?, side(h)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(s: &str) -> Size {
        s.parse().unwrap()
    }

    fn unlimited(width: u32, height: u32) -> ImageInfo {
        ImageInfo::new(width, height)
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_forms() {
        assert_eq!(size("max").kind, SizeKind::Max);
        assert_eq!(size("100,").kind, SizeKind::FixedWidth(100));
        assert_eq!(size(",50").kind, SizeKind::FixedHeight(50));
        assert_eq!(size("pct:25").kind, SizeKind::Percent(25.0));
        assert_eq!(size("100,50").kind, SizeKind::Pixel { w: 100, h: 50 });
        assert_eq!(
            size("!100,50").kind,
            SizeKind::PreservedAspect { w: 100, h: 50 }
        );
        assert!(!size("max").upscaleable);
    }

    #[test]
    fn test_parse_upscaleable_prefix() {
        for input in ["^max", "^100,", "^,50", "^pct:150", "^100,50", "^!100,50"] {
            assert!(size(input).upscaleable, "{} should be upscaleable", input);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in [
            "", "full", ",", "0,", ",0", "!100,", "!,100", "pct:0", "pct:101", "pct:abc", "1,2,3",
            "^", "^^max",
        ] {
            assert!(
                matches!(input.parse::<Size>(), Err(IiifError::InvalidSize(_))),
                "expected {:?} to be rejected",
                input
            );
        }
    }

    // =========================================================================
    // Normalization
    // =========================================================================

    #[test]
    fn test_upscaleable_always_rejected() {
        let region = PixelRegion::new(0, 0, 100, 100);
        for input in ["^max", "^10,", "^,10", "^pct:50", "^10,10", "^!10,10"] {
            let result = size(input).normalize(&region, &unlimited(100, 100));
            assert_eq!(result, Err(IiifError::UpscalingUnsupported), "{}", input);
        }
    }

    #[test]
    fn test_max_without_limits_is_region() {
        let region = PixelRegion::new(10, 10, 80, 40);
        assert_eq!(
            size("max").normalize(&region, &unlimited(100, 100)).unwrap(),
            PixelSize::new(80, 40)
        );
    }

    #[test]
    fn test_max_with_larger_limit_exceeds_region() {
        let region = PixelRegion::new(0, 0, 50, 50);
        let info = unlimited(100, 100).with_max_width(100).with_max_height(100);
        let result = size("max").normalize(&region, &info);
        assert_eq!(
            result,
            Err(IiifError::SizeConstraint(SizeConstraintViolation::RegionWidth {
                width: 100,
                limit: 50
            }))
        );
    }

    #[test]
    fn test_fixed_width() {
        let region = PixelRegion::new(0, 0, 200, 100);
        assert_eq!(
            size("100,").normalize(&region, &unlimited(200, 100)).unwrap(),
            PixelSize::new(100, 50)
        );
    }

    #[test]
    fn test_fixed_height() {
        let region = PixelRegion::new(0, 0, 200, 100);
        assert_eq!(
            size(",25").normalize(&region, &unlimited(200, 100)).unwrap(),
            PixelSize::new(50, 25)
        );
    }

    #[test]
    fn test_percent() {
        let region = PixelRegion::new(0, 0, 200, 101);
        // 101 * 50% = 50.5 -> 50
        assert_eq!(
            size("pct:50").normalize(&region, &unlimited(200, 101)).unwrap(),
            PixelSize::new(100, 50)
        );
    }

    #[test]
    fn test_preserved_aspect_width_wins() {
        let region = PixelRegion::new(0, 0, 200, 100);
        assert_eq!(
            size("!100,100")
                .normalize(&region, &unlimited(200, 100))
                .unwrap(),
            PixelSize::new(100, 50)
        );
    }

    #[test]
    fn test_preserved_aspect_tie_prefers_width() {
        let region = PixelRegion::new(0, 0, 100, 50);
        assert_eq!(
            size("!100,100")
                .normalize(&region, &unlimited(100, 50))
                .unwrap(),
            PixelSize::new(100, 50)
        );
    }

    #[test]
    fn test_preserved_aspect_height_wins_for_tall_region() {
        let region = PixelRegion::new(0, 0, 100, 400);
        assert_eq!(
            size("!100,100")
                .normalize(&region, &unlimited(100, 400))
                .unwrap(),
            PixelSize::new(25, 100)
        );
    }

    #[test]
    fn test_preserved_aspect_respects_server_limits() {
        let region = PixelRegion::new(0, 0, 1000, 1000);
        let info = unlimited(1000, 1000).with_max_width(300);
        // maxHeight falls back to maxWidth
        assert_eq!(
            size("!500,500").normalize(&region, &info).unwrap(),
            PixelSize::new(300, 300)
        );
    }

    #[test]
    fn test_validation_order() {
        let region = PixelRegion::new(0, 0, 100, 100);
        let info = unlimited(100, 100)
            .with_max_width(80)
            .with_max_height(60)
            .with_max_area(1000);

        let err = size("150,150").normalize(&region, &info).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::RegionWidth { .. })
        ));

        let err = size("50,150").normalize(&region, &info).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::RegionHeight { .. })
        ));

        let err = size("90,90").normalize(&region, &info).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::MaxWidth { .. })
        ));

        let err = size("70,70").normalize(&region, &info).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::MaxHeight { .. })
        ));

        let err = size("50,50").normalize(&region, &info).unwrap_err();
        assert_eq!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::MaxArea {
                area: 2500,
                limit: 1000
            })
        );

        assert_eq!(
            size("20,20").normalize(&region, &info).unwrap(),
            PixelSize::new(20, 20)
        );
    }

    #[test]
    fn test_max_height_defaults_to_max_width() {
        let region = PixelRegion::new(0, 0, 100, 100);
        let info = unlimited(100, 100).with_max_width(50);
        let err = size("40,60").normalize(&region, &info).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::MaxHeight { limit: 50, .. })
        ));
    }

    #[test]
    fn test_percent_rounding_to_zero_is_rejected() {
        let region = PixelRegion::new(0, 0, 1, 1);
        let err = size("pct:10").normalize(&region, &unlimited(1, 1)).unwrap_err();
        assert!(matches!(
            err,
            IiifError::SizeConstraint(SizeConstraintViolation::Empty { .. })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(PixelSize::new(640, 480).to_string(), "640,480");
    }
}
