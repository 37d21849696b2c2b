//! Image information: server limits and the `info.json` document.

use serde::Serialize;

/// JSON-LD context for IIIF Image API 3.0.
pub const IIIF_CONTEXT: &str = "http://iiif.io/api/image/3/context.json";

/// Protocol URI for IIIF Image API.
pub const IIIF_PROTOCOL: &str = "http://iiif.io/api/image";

/// Tile edge advertised to viewers.
pub const TILE_SIZE: u32 = 512;

/// Highest scale factor advertised in `tiles` (factors run 1..=19).
const MAX_SCALE_FACTOR: u32 = 19;

/// Native dimensions of an image plus optional server-imposed ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_area: Option<u64>,
}

impl ImageInfo {
    /// Image info without any server limits.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_width: None,
            max_height: None,
            max_area: None,
        }
    }

    /// Limits equal to the native dimensions, as advertised by this server.
    pub fn native(width: u32, height: u32) -> Self {
        Self::new(width, height)
            .with_max_width(width)
            .with_max_height(height)
    }

    pub fn with_max_width(mut self, max_width: u32) -> Self {
        self.max_width = Some(max_width);
        self
    }

    pub fn with_max_height(mut self, max_height: u32) -> Self {
        self.max_height = Some(max_height);
        self
    }

    pub fn with_max_area(mut self, max_area: u64) -> Self {
        self.max_area = Some(max_area);
        self
    }

    /// `maxHeight`, falling back to `maxWidth` when only the latter is declared.
    pub fn effective_max_height(&self) -> Option<u32> {
        self.max_height.or(self.max_width)
    }

    /// Build the `info.json` document served under `id`.
    pub fn document(&self, id: impl Into<String>) -> InfoDocument {
        InfoDocument {
            context: IIIF_CONTEXT,
            id: id.into(),
            kind: "ImageService3",
            protocol: IIIF_PROTOCOL,
            profile: "level1",
            width: self.width,
            height: self.height,
            max_width: self.max_width,
            max_height: self.max_height,
            max_area: self.max_area,
            tiles: vec![TileSpec {
                width: TILE_SIZE,
                height: TILE_SIZE,
                scale_factors: (1..=MAX_SCALE_FACTOR).collect(),
            }],
            preferred_formats: vec!["webp", "png", "jpg"],
            extra_formats: vec!["webp"],
        }
    }
}

/// IIIF Image API 3.0 image information document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoDocument {
    #[serde(rename = "@context")]
    pub context: &'static str,

    pub id: String,

    #[serde(rename = "type")]
    pub kind: &'static str,

    pub protocol: &'static str,

    pub profile: &'static str,

    pub width: u32,

    pub height: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_area: Option<u64>,

    pub tiles: Vec<TileSpec>,

    pub preferred_formats: Vec<&'static str>,

    pub extra_formats: Vec<&'static str>,
}

/// One entry of the `tiles` array.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSpec {
    pub width: u32,
    pub height: u32,
    pub scale_factors: Vec<u32>,
}
