//! HDU traversal and image decoding.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::header::{Header, BLOCK_SIZE};
use crate::error::FitsError;

/// The kind of an HDU, from SIMPLE/XTENSION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HduKind {
    Primary,
    Image,
    BinTable,
    Table,
    Other(String),
}

/// Pixel layout of an image HDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitpix {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Bitpix {
    pub fn from_value(value: i64) -> Result<Self, FitsError> {
        match value {
            8 => Ok(Bitpix::U8),
            16 => Ok(Bitpix::I16),
            32 => Ok(Bitpix::I32),
            64 => Ok(Bitpix::I64),
            -32 => Ok(Bitpix::F32),
            -64 => Ok(Bitpix::F64),
            other => Err(FitsError::UnsupportedBitpix(other)),
        }
    }

    pub fn bytes_per_value(&self) -> usize {
        match self {
            Bitpix::U8 => 1,
            Bitpix::I16 => 2,
            Bitpix::I32 | Bitpix::F32 => 4,
            Bitpix::I64 | Bitpix::F64 => 8,
        }
    }

    fn is_integer(&self) -> bool {
        !matches!(self, Bitpix::F32 | Bitpix::F64)
    }
}

/// Location and layout of one HDU within a file.
#[derive(Debug, Clone)]
pub struct HduInfo {
    pub index: usize,
    pub kind: HduKind,
    pub bitpix: Bitpix,
    /// NAXISn in file order (NAXIS1 first, the fastest varying axis)
    pub axes: Vec<usize>,
    pub data_offset: u64,
    /// Data length without block padding
    pub data_len: u64,
    pub bscale: f64,
    pub bzero: f64,
    pub blank: Option<i64>,
    /// ZNAXISn of a tile-compressed image stored as a binary table
    pub compressed_axes: Option<Vec<usize>>,
    pub compression: Option<String>,
}

impl HduInfo {
    fn from_header(
        index: usize,
        header: &Header,
        data_offset: u64,
    ) -> Result<Self, FitsError> {
        let kind = if index == 0 {
            HduKind::Primary
        } else {
            match header.text("XTENSION").map(str::trim) {
                Some("IMAGE") => HduKind::Image,
                Some("BINTABLE") => HduKind::BinTable,
                Some("TABLE") => HduKind::Table,
                Some(other) => HduKind::Other(other.to_string()),
                None => return Err(FitsError::MissingKeyword("XTENSION".to_string())),
            }
        };

        let bitpix = Bitpix::from_value(header.integer("BITPIX")?)?;
        let axes = read_axes(header, "NAXIS")?;

        let pcount = header.opt_integer("PCOUNT")?.unwrap_or(0);
        let gcount = header.opt_integer("GCOUNT")?.unwrap_or(1);
        if pcount < 0 || gcount < 0 {
            return Err(FitsError::InvalidValue {
                keyword: "PCOUNT/GCOUNT".to_string(),
                message: format!("negative value ({}, {})", pcount, gcount),
            });
        }
        let data_len = data_length(bitpix, &axes, pcount as u64, gcount as u64)?;

        let (compressed_axes, compression) =
            if kind == HduKind::BinTable && header.logical("ZIMAGE") {
                (
                    Some(read_axes(header, "ZNAXIS")?),
                    header.text("ZCMPTYPE").map(|s| s.trim().to_string()),
                )
            } else {
                (None, None)
            };

        Ok(Self {
            index,
            kind,
            bitpix,
            axes,
            data_offset,
            data_len,
            bscale: header.opt_float("BSCALE")?.unwrap_or(1.0),
            bzero: header.opt_float("BZERO")?.unwrap_or(0.0),
            blank: header.opt_integer("BLANK")?,
            compressed_axes,
            compression,
        })
    }

    /// Axes of the image this HDU carries, decompressed view for tile-compressed HDUs.
    pub fn image_axes(&self) -> &[usize] {
        self.compressed_axes.as_deref().unwrap_or(&self.axes)
    }

    /// `(width, height)` of a 2-D image HDU.
    pub fn dimensions(&self) -> Result<(u32, u32), FitsError> {
        let axes = self.image_axes();
        if axes.len() != 2 {
            return Err(FitsError::InvalidDimensions(axes.len()));
        }
        let to_u32 = |n: usize, keyword: &str| {
            u32::try_from(n).map_err(|_| FitsError::InvalidValue {
                keyword: keyword.to_string(),
                message: format!("{} does not fit in 32 bits", n),
            })
        };
        Ok((to_u32(axes[0], "NAXIS1")?, to_u32(axes[1], "NAXIS2")?))
    }
}

fn read_axes(header: &Header, prefix: &str) -> Result<Vec<usize>, FitsError> {
    let count = header.integer(prefix)?;
    if !(0..=999).contains(&count) {
        return Err(FitsError::InvalidValue {
            keyword: prefix.to_string(),
            message: format!("{} axes", count),
        });
    }
    (1..=count)
        .map(|i| {
            let keyword = format!("{}{}", prefix, i);
            let n = header.integer(&keyword)?;
            usize::try_from(n).map_err(|_| FitsError::InvalidValue {
                keyword,
                message: format!("negative length {}", n),
            })
        })
        .collect()
}

fn too_large(keyword: &str) -> FitsError {
    FitsError::InvalidValue {
        keyword: keyword.to_string(),
        message: "data size does not fit in 64 bits".to_string(),
    }
}

/// `|BITPIX|/8 * GCOUNT * (PCOUNT + NAXIS1 * ... * NAXISn)`, zero without axes.
fn data_length(
    bitpix: Bitpix,
    axes: &[usize],
    pcount: u64,
    gcount: u64,
) -> Result<u64, FitsError> {
    let elements = if axes.is_empty() {
        0
    } else {
        axes.iter()
            .try_fold(1u64, |acc, &n| acc.checked_mul(n as u64))
            .ok_or_else(|| too_large("NAXIS"))?
    };
    pcount
        .checked_add(elements)
        .and_then(|n| n.checked_mul(gcount))
        .and_then(|n| n.checked_mul(bitpix.bytes_per_value() as u64))
        .ok_or_else(|| too_large("PCOUNT/GCOUNT"))
}

fn padded(len: u64) -> Option<u64> {
    len.div_ceil(BLOCK_SIZE as u64).checked_mul(BLOCK_SIZE as u64)
}

/// Locate HDU `index`, skipping over the data of the HDUs before it.
pub fn find_hdu<R: Read + Seek>(reader: &mut R, index: usize) -> Result<HduInfo, FitsError> {
    let mut offset = reader.seek(SeekFrom::Start(0))?;
    let mut current = 0;

    loop {
        let (header, header_len) = match Header::read_from(reader, offset)? {
            Some(parsed) => parsed,
            None => return Err(FitsError::HduNotFound(index)),
        };
        let data_offset = offset + header_len;
        let info = HduInfo::from_header(current, &header, data_offset)?;

        if current == index {
            return Ok(info);
        }

        offset = padded(info.data_len)
            .and_then(|len| data_offset.checked_add(len))
            .ok_or_else(|| too_large("NAXIS"))?;
        reader.seek(SeekFrom::Start(offset))?;
        current += 1;
    }
}

/// A decoded 2-D image, row-major with the first FITS row first.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl ImagePlane {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }
}

/// Decode the pixels of a 2-D image HDU. BLANK values become NaN.
pub fn read_image<R: Read + Seek>(reader: &mut R, info: &HduInfo) -> Result<ImagePlane, FitsError> {
    let (width, height) = info.dimensions()?;
    if info.compressed_axes.is_some() {
        return Err(FitsError::UnsupportedCompression(
            info.compression
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        ));
    }

    let value_size = info.bitpix.bytes_per_value();
    let expected = (width as u64)
        .checked_mul(height as u64)
        .and_then(|n| n.checked_mul(value_size as u64))
        .ok_or_else(|| too_large("NAXIS"))?;

    // Check the file holds the data before allocating for it
    let file_len = reader.seek(SeekFrom::End(0))?;
    if info.data_offset.saturating_add(expected) > file_len {
        return Err(FitsError::Truncated {
            offset: info.data_offset,
            expected,
        });
    }
    let len = usize::try_from(expected).map_err(|_| too_large("NAXIS"))?;
    let mut raw = vec![0u8; len];
    let (width, height) = (width as usize, height as usize);

    reader.seek(SeekFrom::Start(info.data_offset))?;
    reader.read_exact(&mut raw).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FitsError::Truncated {
                offset: info.data_offset,
                expected,
            }
        } else {
            e.into()
        }
    })?;

    let blank = if info.bitpix.is_integer() {
        info.blank
    } else {
        None
    };
    let scale = |v: f64| (info.bzero + info.bscale * v) as f32;

    let data = raw
        .chunks_exact(value_size)
        .map(|b| {
            let (value, integer) = match info.bitpix {
                Bitpix::U8 => (b[0] as f64, Some(b[0] as i64)),
                Bitpix::I16 => {
                    let v = i16::from_be_bytes([b[0], b[1]]);
                    (v as f64, Some(v as i64))
                }
                Bitpix::I32 => {
                    let v = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                    (v as f64, Some(v as i64))
                }
                Bitpix::I64 => {
                    let v = i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                    (v as f64, Some(v))
                }
                Bitpix::F32 => (f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64, None),
                Bitpix::F64 => (
                    f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
                    None,
                ),
            };
            match (blank, integer) {
                (Some(blank), Some(v)) if blank == v => f32::NAN,
                _ => scale(value),
            }
        })
        .collect();

    Ok(ImagePlane::new(width, height, data))
}

/// `(width, height)` of HDU `index` in the file at `path`.
pub fn hdu_dimensions(path: &Path, index: usize) -> Result<(u32, u32), FitsError> {
    let mut reader = BufReader::new(File::open(path)?);
    find_hdu(&mut reader, index)?.dimensions()
}

/// Decode HDU `index` of the file at `path`.
pub fn read_image_plane(path: &Path, index: usize) -> Result<ImagePlane, FitsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let info = find_hdu(&mut reader, index)?;
    read_image(&mut reader, &info)
}
