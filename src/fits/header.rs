//! FITS header parsing.
//!
//! A header is a sequence of 2880-byte blocks, each holding 36 cards of 80
//! ASCII characters. Value cards carry `= ` in columns 9-10; the header ends
//! with an `END` card and is padded to a block boundary.

use std::io::Read;

use crate::error::FitsError;

/// Size of a FITS logical record.
pub const BLOCK_SIZE: usize = 2880;

/// Size of one header card.
pub const CARD_SIZE: usize = 80;

/// A parsed card value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// The keyword/value cards of one HDU header, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, HeaderValue)>,
}

impl Header {
    /// Read blocks from `reader` until the END card.
    ///
    /// Returns `Ok(None)` when the reader is exhausted before the first byte,
    /// which marks the end of the HDU list. `offset` is only used for errors.
    pub fn read_from<R: Read>(
        reader: &mut R,
        offset: u64,
    ) -> Result<Option<(Header, u64)>, FitsError> {
        let mut header = Header::default();
        let mut block = [0u8; BLOCK_SIZE];
        let mut consumed = 0u64;

        loop {
            let filled = read_full(reader, &mut block)?;
            if filled == 0 && consumed == 0 {
                return Ok(None);
            }
            if filled < BLOCK_SIZE {
                if consumed == 0 && block[..filled].iter().all(|b| *b == 0) {
                    // Zero padding after the last HDU
                    return Ok(None);
                }
                return Err(FitsError::MissingEnd(offset));
            }
            consumed += BLOCK_SIZE as u64;

            for card in block.chunks_exact(CARD_SIZE) {
                let keyword = keyword_of(card);
                if keyword == "END" {
                    return Ok(Some((header, consumed)));
                }
                if let Some(value) = parse_value(card) {
                    header.cards.push((keyword, value));
                }
            }
        }
    }

    /// Parse a header held entirely in memory.
    pub fn parse(bytes: &[u8]) -> Result<(Header, u64), FitsError> {
        let mut cursor = bytes;
        Header::read_from(&mut cursor, 0)?.ok_or(FitsError::MissingEnd(0))
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.get(keyword).is_some()
    }

    /// Required integer keyword.
    pub fn integer(&self, keyword: &str) -> Result<i64, FitsError> {
        self.opt_integer(keyword)?
            .ok_or_else(|| FitsError::MissingKeyword(keyword.to_string()))
    }

    /// Optional integer keyword. Present with another type is an error.
    pub fn opt_integer(&self, keyword: &str) -> Result<Option<i64>, FitsError> {
        match self.get(keyword) {
            None => Ok(None),
            Some(HeaderValue::Integer(v)) => Ok(Some(*v)),
            Some(other) => Err(invalid(keyword, other)),
        }
    }

    /// Optional real keyword; integers are widened.
    pub fn opt_float(&self, keyword: &str) -> Result<Option<f64>, FitsError> {
        match self.get(keyword) {
            None => Ok(None),
            Some(HeaderValue::Float(v)) => Ok(Some(*v)),
            Some(HeaderValue::Integer(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(invalid(keyword, other)),
        }
    }

    pub fn logical(&self, keyword: &str) -> bool {
        matches!(self.get(keyword), Some(HeaderValue::Logical(true)))
    }

    pub fn text(&self, keyword: &str) -> Option<&str> {
        match self.get(keyword) {
            Some(HeaderValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

fn invalid(keyword: &str, value: &HeaderValue) -> FitsError {
    FitsError::InvalidValue {
        keyword: keyword.to_string(),
        message: format!("unexpected value {:?}", value),
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FitsError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn keyword_of(card: &[u8]) -> String {
    String::from_utf8_lossy(&card[..8]).trim_end().to_string()
}

/// Parse the value field of a card, or `None` for commentary cards.
fn parse_value(card: &[u8]) -> Option<HeaderValue> {
    if &card[8..10] != b"= " {
        return None;
    }
    let field = String::from_utf8_lossy(&card[10..]);
    let field = field.trim_start();

    if let Some(quoted) = field.strip_prefix('\'') {
        return Some(HeaderValue::Text(parse_string(quoted)));
    }

    let raw = field.split('/').next().unwrap_or("").trim();
    match raw {
        "" => None,
        "T" => Some(HeaderValue::Logical(true)),
        "F" => Some(HeaderValue::Logical(false)),
        _ => {
            if let Ok(v) = raw.parse::<i64>() {
                return Some(HeaderValue::Integer(v));
            }
            raw.replace(['D', 'd'], "E")
                .parse::<f64>()
                .ok()
                .map(HeaderValue::Float)
        }
    }
}

/// Parse a quoted string body where `''` escapes a quote. Trailing blanks are
/// not significant.
fn parse_string(body: &str) -> String {
    let mut out = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                out.push('\'');
                continue;
            }
            break;
        }
        out.push(c);
    }
    out.trim_end().to_string()
}

// =============================================================================
// Test Helpers
// =============================================================================

/// Format one header card, padded to 80 characters.
#[cfg(test)]
pub(crate) fn card(keyword: &str, value: &str) -> String {
    let text = if value.is_empty() {
        keyword.to_string()
    } else {
        format!("{:<8}= {:>20}", keyword, value)
    };
    format!("{:<80}", text)
}

/// Assemble cards plus END into a padded header block sequence.
#[cfg(test)]
pub(crate) fn header_bytes(cards: &[String]) -> Vec<u8> {
    let mut text: String = cards.concat();
    text.push_str(&format!("{:<80}", "END"));
    let mut bytes = text.into_bytes();
    let padded = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    bytes.resize(padded, b' ');
    bytes
}
