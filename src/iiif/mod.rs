//! IIIF Image API request algebra.
//!
//! Parses the `{region}/{size}/{rotation}/{quality}.{format}` path segments and
//! normalizes them into exact pixel operations against a known image.
//!
//! ```text
//! "pct:50,50,50,50" ──parse──▶ Region ──normalize(200x100)──▶ PixelRegion(100,50,100,50)
//! "!100,100"        ──parse──▶ Size   ──normalize(region)───▶ PixelSize(100,50)
//! ```
//!
//! Normalization is pure: no I/O, no allocation beyond the returned values.
//! Every fractional result goes through [`round_half_even`] so region and size
//! math agree on rounding.

mod info;
mod region;
mod request;
mod size;

pub use info::{ImageInfo, InfoDocument, TileSpec, IIIF_CONTEXT, IIIF_PROTOCOL, TILE_SIZE};
pub use region::{PixelRegion, Region};
pub use request::{ImageFormat, ImageRequest, NormalizedRequest, Quality, Rotation};
pub use size::{PixelSize, Size, SizeKind};

/// Round to the nearest integer, ties to even, saturating into `u32`.
pub(crate) fn round_half_even(value: f64) -> u32 {
    let rounded = value.round_ties_even();
    if rounded <= 0.0 || rounded.is_nan() {
        0
    } else if rounded >= u32::MAX as f64 {
        u32::MAX
    } else {
        rounded as u32
    }
}
