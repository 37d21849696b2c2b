//! Minimal FITS reader.
//!
//! Enough of the FITS standard to walk the HDU list of a frame, report the
//! pixel dimensions of an image HDU and load a 2-D plane as `f32` samples:
//!
//! - [`header`] parses 2880-byte header blocks of 80-character cards
//! - [`hdu`] locates HDUs and decodes big-endian image data
//! - [`stretch`] maps samples to display intensities with zscale

pub mod hdu;
pub mod header;
pub mod stretch;

pub use hdu::{
    find_hdu, hdu_dimensions, read_image, read_image_plane, Bitpix, HduInfo, HduKind, ImagePlane,
};
pub use header::{Header, HeaderValue, BLOCK_SIZE, CARD_SIZE};
pub use stretch::ZScale;
