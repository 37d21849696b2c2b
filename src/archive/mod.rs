//! Client for the frame archive API.
//!
//! The archive exposes frame metadata at `GET {api}/frames/{id}/` and serves
//! the FITS files of each version from a URL listed in that metadata.

mod client;

pub use client::HttpArchiveClient;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// The current version of a frame as reported by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameVersion {
    /// File name without extension
    pub basename: String,
    pub version_id: String,
    /// Extension including the leading dot, e.g. `.fits.fz`
    pub extension: String,
    /// Where the file of this version can be downloaded
    pub url: String,
}

impl FrameVersion {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.basename, self.extension)
    }
}

/// A download in progress.
pub struct Download {
    /// Value of `Content-Length`, when the server sent one
    pub total: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, ArchiveError>>,
}

/// Access to frame metadata and file contents.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Base URL of the API. Cache entries are partitioned by this value.
    fn base_url(&self) -> &str;

    /// Look up the current version of `frame_id`.
    async fn frame_version(&self, frame_id: &str) -> Result<FrameVersion, ArchiveError>;

    /// Start streaming the file at `url`.
    async fn download(&self, url: &str) -> Result<Download, ArchiveError>;
}
