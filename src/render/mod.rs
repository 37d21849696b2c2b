//! Rendering of FITS planes into encoded output images.
//!
//! The pipeline is fixed: zscale stretch over the whole plane, crop to the
//! normalized region, resize to the normalized size, encode as 8-bit
//! grayscale.

mod encoder;

pub use encoder::{render, write_generated, RenderedImage, JPEG_QUALITY};
