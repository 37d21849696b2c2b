use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or normalizing an IIIF image request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IiifError {
    /// Region segment does not match `full`, `square`, `x,y,w,h` or `pct:x,y,w,h`
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    /// Size segment does not match any of the IIIF size forms
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// Only a rotation of `0` is served
    #[error("Unsupported rotation: {0} (only 0 is supported)")]
    UnsupportedRotation(String),

    /// Only the `default` quality is served
    #[error("Unsupported quality: {0} (only default is supported)")]
    UnsupportedQuality(String),

    /// Output format outside of webp, png and jpg
    #[error("Unsupported format: {0} (expected webp, png or jpg)")]
    UnsupportedFormat(String),

    /// Region origin lies beyond the image bounds
    #[error("Region origin ({x}, {y}) lies outside the {width}x{height} image")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// `^` size forms are rejected (should map to HTTP 501)
    #[error("Upscaling is not supported")]
    UpscalingUnsupported,

    /// Normalized size breaks a region or server constraint
    #[error("Size constraint violated: {0}")]
    SizeConstraint(#[from] SizeConstraintViolation),
}

/// The constraint a normalized size broke, naming the offending dimension.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeConstraintViolation {
    #[error("width {width} exceeds the region width {limit}")]
    RegionWidth { width: u32, limit: u32 },

    #[error("height {height} exceeds the region height {limit}")]
    RegionHeight { height: u32, limit: u32 },

    #[error("width {width} exceeds maxWidth {limit}")]
    MaxWidth { width: u32, limit: u32 },

    #[error("height {height} exceeds maxHeight {limit}")]
    MaxHeight { height: u32, limit: u32 },

    #[error("area {area} exceeds maxArea {limit}")]
    MaxArea { area: u64, limit: u64 },

    #[error("size {width}x{height} has an empty dimension")]
    Empty { width: u32, height: u32 },
}

/// Errors that can occur when reading FITS files
#[derive(Debug, Clone, Error)]
pub enum FitsError {
    /// Underlying file could not be read
    #[error("I/O error: {0}")]
    Io(String),

    /// File ended inside a header or data unit
    #[error("Truncated FITS file: expected {expected} bytes at offset {offset}")]
    Truncated { offset: u64, expected: u64 },

    /// Header block did not contain an END card
    #[error("Header starting at offset {0} has no END card")]
    MissingEnd(u64),

    /// Required keyword is missing from a header
    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),

    /// Keyword has a value of the wrong type or range
    #[error("Invalid value for {keyword}: {message}")]
    InvalidValue { keyword: String, message: String },

    /// BITPIX outside of 8, 16, 32, 64, -32, -64
    #[error("Unsupported BITPIX: {0}")]
    UnsupportedBitpix(i64),

    /// Requested HDU index is past the last HDU
    #[error("HDU index {0} not found")]
    HduNotFound(usize),

    /// HDU is not a 2-D image
    #[error("HDU has an invalid number of dimensions: {0}")]
    InvalidDimensions(usize),

    /// Tile-compressed pixel data cannot be decoded
    #[error("Unsupported compressed image: {0}")]
    UnsupportedCompression(String),
}

impl From<std::io::Error> for FitsError {
    fn from(err: std::io::Error) -> Self {
        FitsError::Io(err.to_string())
    }
}

/// Errors that can occur while rendering an image plane
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// Region does not overlap the image at all
    #[error("Region {0} does not intersect the image")]
    EmptyRegion(String),

    /// Encoder rejected the pixel buffer
    #[error("Failed to encode image: {0}")]
    Encode(String),

    /// Encoded output could not be written
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors from the archive API and the on-disk frame cache
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// Archive answered with a non-success status
    #[error("Failed to fetch frame info: HTTP {status}")]
    Status { status: u16 },

    /// Network or connection error
    #[error("Archive connection error: {0}")]
    Connection(String),

    /// Frame metadata is missing fields or is not JSON
    #[error("Failed to parse frame metadata: {0}")]
    Metadata(String),

    /// Frame identifier cannot be used as a path component
    #[error("Invalid frame id: {0}")]
    InvalidFrameId(String),

    /// `latest` alias does not point at exactly one file
    #[error("Download cache is in invalid state: {0}")]
    InvalidCacheState(String),

    /// Local cache filesystem error
    #[error("Cache I/O error: {0}")]
    Io(String),
}

impl ArchiveError {
    /// Whether a step failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::Status { status } => *status >= 500,
            ArchiveError::Connection(_) | ArchiveError::Io(_) => true,
            ArchiveError::Metadata(_)
            | ArchiveError::InvalidFrameId(_)
            | ArchiveError::InvalidCacheState(_) => false,
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err.to_string())
    }
}

/// Errors from the object store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Store answered a request with an error status
    #[error("Store rejected request with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Multipart upload no longer exists
    #[error("Upload not found: {0}")]
    NoSuchUpload(String),

    /// Presigned URL could not be produced
    #[error("Presign error: {0}")]
    Presign(String),
}

impl StoreError {
    /// Throttling and server-side failures are retryable, client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            StoreError::NoSuchUpload(_) | StoreError::Presign(_) => false,
            StoreError::S3(_) | StoreError::Connection(_) => true,
        }
    }
}

/// Errors from the persisted step log
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(String),

    #[error("Corrupt history record: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Io(err.to_string())
    }
}

// =============================================================================
// Step and Pipeline Errors
// =============================================================================

/// Which liveness limit an attempt ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    StartToClose,
    ScheduleToStart,
    Heartbeat,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::StartToClose => "start-to-close",
            TimeoutKind::ScheduleToStart => "schedule-to-start",
            TimeoutKind::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Failure of a single step attempt.
///
/// Serialized into the step log so replayed failures keep their retry
/// classification.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// Failure raised by the step body
    #[error("{message}")]
    Application { message: String, non_retryable: bool },

    /// Attempt exceeded one of its liveness limits
    #[error("{timeout} timeout")]
    Timeout { timeout: TimeoutKind },

    /// Attempt was interrupted by cancellation
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// A failure that must not be attempted again.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        StepError::Application {
            message: message.into(),
            non_retryable: true,
        }
    }

    /// A failure the retry policy may attempt again.
    pub fn retryable(message: impl Into<String>) -> Self {
        StepError::Application {
            message: message.into(),
            non_retryable: false,
        }
    }

    pub fn timeout(timeout: TimeoutKind) -> Self {
        StepError::Timeout { timeout }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Application { non_retryable, .. } => !non_retryable,
            StepError::Timeout { .. } => true,
            StepError::Cancelled => false,
        }
    }
}

impl From<ArchiveError> for StepError {
    fn from(err: ArchiveError) -> Self {
        StepError::Application {
            non_retryable: !err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Application {
            non_retryable: !err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<FitsError> for StepError {
    fn from(err: FitsError) -> Self {
        let non_retryable = !matches!(err, FitsError::Io(_));
        StepError::Application {
            message: err.to_string(),
            non_retryable,
        }
    }
}

impl From<RenderError> for StepError {
    fn from(err: RenderError) -> Self {
        let non_retryable = !matches!(err, RenderError::Io(_));
        StepError::Application {
            message: err.to_string(),
            non_retryable,
        }
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::retryable(err.to_string())
    }
}

/// Failure of a workflow run.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A step failed after its retry policy gave up
    #[error("Step {step} failed: {source}")]
    Step { step: String, source: StepError },

    /// The run was cancelled
    #[error("Workflow cancelled")]
    Cancelled,

    /// The run did not finish within its execution timeout
    #[error("Workflow exceeded its execution timeout of {0:?}")]
    ExecutionTimeout(Duration),

    /// Replayed history does not match the steps the workflow issued
    #[error("Non-deterministic replay at step #{seq}: expected {expected}, history has {found}")]
    NonDeterministic {
        seq: u64,
        expected: String,
        found: String,
    },

    /// Step log could not be read or written
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// Output could not be encoded into or decoded from the step log
    #[error("Workflow output error: {0}")]
    Output(String),

    /// The task driving the run panicked or was aborted
    #[error("Workflow task failed: {0}")]
    Aborted(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Failures that may succeed when the whole pipeline is started again.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Step { source, .. } => source.is_retryable(),
            PipelineError::History(HistoryError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Errors returned by the HTTP layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Iiif(#[from] IiifError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Path parameter failed validation
    #[error("Invalid path parameter: {0}")]
    InvalidPath(String),
}
