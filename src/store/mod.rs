//! Object storage for generated images.
//!
//! Generated images are written with multipart uploads and served to
//! clients through presigned GET URLs:
//!
//! - [`S3ObjectStore`] talks to S3 or an S3-compatible service
//! - [`InMemoryObjectStore`] keeps objects in memory for tests and local runs

mod memory;
mod s3;

pub use memory::InMemoryObjectStore;
pub use s3::{create_s3_client, S3ObjectStore};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Body of one part upload. `content_length` must match the streamed bytes.
pub struct PartBody {
    pub content_length: u64,
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

impl PartBody {
    /// A part held entirely in memory.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            content_length: bytes.len() as u64,
            stream: Box::pin(futures::stream::once(async move { Ok(bytes) })),
        }
    }
}

/// A finished part, as reported back to `complete_multipart_upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Multipart-capable object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StoreError>;

    /// Upload one part. Part numbers start at 1. Returns the part's ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: PartBody,
    ) -> Result<String, StoreError>;

    /// Commit the upload with its parts in ascending order. Returns the object key.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError>;

    /// Discard an upload and every part uploaded so far.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    /// URL granting temporary read access to `key`.
    async fn presigned_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}
