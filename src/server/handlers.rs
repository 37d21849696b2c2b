//! HTTP request handlers for the IIIF image API.
//!
//! # Endpoints
//!
//! - `GET /frames/{frame_id}/fits/hdus/{hdu_index}/info.json` - Image information
//! - `GET /frames/{frame_id}/fits/hdus/{hdu_index}/{region}/{size}/{rotation}/{quality}.{format}` - Image
//! - `GET /examples/dragon/view/{frame_id}/fits/hdus/{hdu_index}` - Viewer page
//! - `GET /statuz` - Liveness
//! - `GET /configz` - Effective configuration

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{OriginalUri, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ApiError, IiifError, PipelineError, StepError};
use crate::iiif::{ImageInfo, ImageRequest, InfoDocument};
use crate::pipeline::{FrameRequest, Pipelines};
use crate::store::ObjectStore;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state.
///
/// This is passed to all handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub pipelines: Pipelines,

    /// Store the generated images are presigned from
    pub store: Arc<dyn ObjectStore>,

    /// Lifetime of the URLs image requests redirect to
    pub presign_ttl: Duration,

    /// Configuration served by `/configz`
    pub config: Arc<serde_json::Value>,
}

impl AppState {
    pub fn new(pipelines: Pipelines, store: Arc<dyn ObjectStore>, presign_ttl: Duration) -> Self {
        Self {
            pipelines,
            store,
            presign_ttl,
            config: Arc::new(serde_json::Value::Null),
        }
    }

    /// Set the document served by `/configz`.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Arc::new(config);
        self
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters identifying one HDU.
///
/// `hdu_index` is parsed by the handler so a bad value yields a JSON error.
#[derive(Debug, Deserialize)]
pub struct FramePathParams {
    pub frame_id: String,
    pub hdu_index: String,
}

impl FramePathParams {
    pub fn hdu_index(&self) -> Result<usize, ApiError> {
        parse_hdu_index(&self.hdu_index)
    }
}

fn parse_hdu_index(raw: &str) -> Result<usize, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::InvalidPath(format!(
            "hdu_index must be a non-negative integer, got {:?}",
            raw
        ))
    })
}

/// Path parameters of an image request.
#[derive(Debug, Deserialize)]
pub struct ImagePathParams {
    pub frame_id: String,
    pub hdu_index: String,
    pub region: String,
    pub size: String,
    pub rotation: String,

    /// `{quality}.{format}`, e.g. `default.jpg`
    pub quality_format: String,
}

/// Query parameters controlling workflow reuse and the frame cache.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PipelineQueryParams {
    /// Reuse the result of an earlier completed run
    #[serde(default = "default_true")]
    pub reuse_workflow: bool,

    /// Download the frame even if it is cached
    #[serde(default)]
    pub force_download: bool,

    /// Ask the archive whether a newer version of the frame exists
    #[serde(default)]
    pub recheck_version: bool,
}

impl Default for PipelineQueryParams {
    fn default() -> Self {
        Self {
            reuse_workflow: true,
            force_download: false,
            recheck_version: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl PipelineQueryParams {
    fn frame_request(&self, frame_id: &str, hdu_index: usize) -> FrameRequest {
        FrameRequest {
            frame_id: frame_id.to_string(),
            hdu_index,
            reuse_workflow: self.reuse_workflow,
            force_download: self.force_download,
            recheck_version: self.recheck_version,
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "invalid_region", "upscaling_unsupported")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

impl ApiError {
    /// Status code and error type identifier for this error.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Iiif(err) => match err {
                IiifError::UpscalingUnsupported => {
                    (StatusCode::NOT_IMPLEMENTED, "upscaling_unsupported")
                }
                IiifError::InvalidRegion(_) => (StatusCode::BAD_REQUEST, "invalid_region"),
                IiifError::InvalidSize(_) => (StatusCode::BAD_REQUEST, "invalid_size"),
                IiifError::UnsupportedRotation(_) => {
                    (StatusCode::BAD_REQUEST, "unsupported_rotation")
                }
                IiifError::UnsupportedQuality(_) => {
                    (StatusCode::BAD_REQUEST, "unsupported_quality")
                }
                IiifError::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "unsupported_format"),
                IiifError::RegionOutOfBounds { .. } => {
                    (StatusCode::BAD_REQUEST, "region_out_of_bounds")
                }
                IiifError::SizeConstraint(_) => (StatusCode::BAD_REQUEST, "size_constraint"),
            },

            ApiError::Pipeline(err) => match err {
                // Failures the step classified as permanent stem from the request
                PipelineError::Step {
                    source: StepError::Application {
                        non_retryable: true,
                        ..
                    },
                    ..
                } => (StatusCode::BAD_REQUEST, "invalid_request"),
                PipelineError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "pipeline_error"),
            },

            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),

            ApiError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "invalid_path"),
        }
    }
}

/// Convert ApiError to HTTP response.
///
/// 5xx errors are logged at ERROR level, 404 at DEBUG and other 4xx at WARN.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        let message = self.to_string();

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// `{proto}://{host}` the request was made to, honouring reverse proxies.
fn request_base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8000");

    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http");

    format!("{}://{}", proto, host)
}

/// Handle image information requests.
///
/// # Endpoint
///
/// `GET /frames/{frame_id}/fits/hdus/{hdu_index}/info.json`
///
/// # Query Parameters
///
/// - `reuse_workflow`: reuse an earlier completed run (default: true)
/// - `force_download`: download the frame even if it is cached (default: false)
/// - `recheck_version`: check the archive for a newer version (default: false)
///
/// # Response
///
/// `200 OK` with an IIIF Image API 3.0 information document. Its `id` is the
/// request URL without query and the `/info.json` suffix.
pub async fn info_handler(
    State(state): State<AppState>,
    Path(params): Path<FramePathParams>,
    Query(query): Query<PipelineQueryParams>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<InfoDocument>, ApiError> {
    let hdu_index = params.hdu_index()?;
    let request = query.frame_request(&params.frame_id, hdu_index);
    let dimensions = state.pipelines.frame_dimensions(&request).await?;

    let id = format!(
        "{}{}",
        request_base_url(&headers),
        uri.path().trim_end_matches("/info.json")
    );
    let info = ImageInfo::native(dimensions.width, dimensions.height);
    Ok(Json(info.document(id)))
}

/// Handle image requests.
///
/// # Endpoint
///
/// `GET /frames/{frame_id}/fits/hdus/{hdu_index}/{region}/{size}/{rotation}/{quality}.{format}`
///
/// # Response
///
/// - `307 Temporary Redirect` to a presigned URL of the generated image
/// - `400 Bad Request`: malformed request, constraint violation or invalid HDU
/// - `501 Not Implemented`: upscaling sizes (`^...`)
/// - `500 Internal Server Error`: generation failed
pub async fn image_handler(
    State(state): State<AppState>,
    Path(params): Path<ImagePathParams>,
    Query(query): Query<PipelineQueryParams>,
) -> Result<Response, ApiError> {
    let hdu_index = parse_hdu_index(&params.hdu_index)?;

    let image = ImageRequest::parse(
        &params.region,
        &params.size,
        &params.rotation,
        &params.quality_format,
    )?;

    // Dimensions come from the shared, reusable dimensions run
    let dimensions = state
        .pipelines
        .frame_dimensions(&FrameRequest::new(&params.frame_id, hdu_index))
        .await?;
    let normalized = image.normalize(&ImageInfo::native(dimensions.width, dimensions.height))?;

    let request = query.frame_request(&params.frame_id, hdu_index);
    let key = state.pipelines.create_image(&request, &normalized).await?;

    let url = state.store.presigned_get(&key, state.presign_ttl).await?;
    debug!(key = %key, "Redirecting to generated image");
    Ok(Redirect::temporary(&url).into_response())
}

/// Handle viewer requests - serves an HTML page with an OpenSeadragon viewer.
///
/// # Endpoint
///
/// `GET /examples/dragon/view/{frame_id}/fits/hdus/{hdu_index}`
pub async fn viewer_handler(
    Path(params): Path<FramePathParams>,
    headers: HeaderMap,
) -> Result<Html<String>, ApiError> {
    let hdu_index = params.hdu_index()?;
    let info_url =
        super::viewer::info_url(&request_base_url(&headers), &params.frame_id, hdu_index);
    Ok(Html(super::viewer::generate_viewer_html(
        &params.frame_id,
        hdu_index,
        &info_url,
    )))
}

/// `GET /statuz`
pub async fn statuz_handler() -> Json<&'static str> {
    Json("Ok")
}

/// `GET /configz`
pub async fn configz_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.as_ref().clone())
}

// =============================================================================
// Tests
// =============================================================================
