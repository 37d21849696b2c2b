//! # fits-iiif
//!
//! An IIIF Image API 3.0 server for FITS frames held in a remote archive.
//!
//! Frames are downloaded once per worker into a versioned disk cache. Image
//! requests run as durable workflows that render the requested region,
//! upload it to S3 with a multipart upload and redirect the client to a
//! presigned URL. Identical requests share one workflow run.
//!
//! ## Features
//!
//! - **IIIF 3.0 level 1**: `info.json`, regions, sizes and the `default` quality
//! - **Native FITS reader**: header parsing, HDU lookup and image planes for every BITPIX
//! - **Durable pipelines**: persisted step history, retries, timeouts and compensations
//! - **Worker affinity**: steps that need a cached frame stay on the worker that fetched it
//! - **Built-in web viewer**: OpenSeadragon page per HDU
//!
//! ## Architecture
//!
//! - [`iiif`] - Request parsing and the region/size algebra
//! - [`fits`] - FITS headers, HDUs and the zscale stretch
//! - [`render`] - Crop, resample and encode to JPEG or PNG
//! - [`archive`] - Frame archive API client
//! - [`cache`] - Versioned on-disk frame cache
//! - [`store`] - Object storage with multipart uploads
//! - [`engine`] - Durable workflow engine
//! - [`pipeline`] - The dimensions and image workflows
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fits_iiif::{
//!     Activities, AppState, Engine, FrameCache, HttpArchiveClient, InMemoryObjectStore,
//!     InMemoryStepLog, LocalAffinity, Pipelines, RetryShell, RouterConfig, WorkerAffinityToken,
//!     Workers, create_router,
//! };
//!
//! # async fn example() {
//! let dir = std::path::Path::new("/tmp/fits-iiif");
//! let token = WorkerAffinityToken::generate();
//! let api = url::Url::parse("https://archive-api.example.org/").unwrap();
//! let archive = Arc::new(HttpArchiveClient::new(reqwest::Client::new(), &api));
//! let store = Arc::new(InMemoryObjectStore::new());
//!
//! let engine = Engine::new(
//!     Arc::new(InMemoryStepLog::new()),
//!     Workers::new(token.clone(), 20),
//!     1000,
//! );
//! let activities = Activities::new(
//!     FrameCache::new(archive, dir),
//!     store.clone(),
//!     Arc::new(LocalAffinity::new(token)),
//!     dir,
//! );
//! let pipelines = Pipelines::new(engine, Arc::new(activities), RetryShell::default());
//! let router = create_router(
//!     AppState::new(pipelines, store, Duration::from_secs(300)),
//!     RouterConfig::default(),
//! );
//! # }
//! ```

pub mod affinity;
pub mod archive;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fits;
pub mod iiif;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use affinity::{AffinityResolver, LocalAffinity, WorkerAffinityToken};
pub use archive::{ArchiveClient, HttpArchiveClient};
pub use cache::{FrameCache, LocalFrame};
pub use config::Config;
pub use engine::{Engine, FileStepLog, InMemoryStepLog, StepLog, Workers};
pub use error::{
    ApiError, ArchiveError, FitsError, IiifError, PipelineError, RenderError, StepError,
    StoreError,
};
pub use iiif::{ImageInfo, ImageRequest, InfoDocument, NormalizedRequest};
pub use pipeline::{Activities, Dimensions, FrameRequest, Pipelines, RetryScope, RetryShell};
pub use server::{create_router, AppState, ErrorResponse, RouterConfig};
pub use store::{create_s3_client, InMemoryObjectStore, ObjectStore, S3ObjectStore};
