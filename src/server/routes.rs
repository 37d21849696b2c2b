//! Router configuration for the IIIF server.
//!
//! # Route Structure
//!
//! ```text
//! /frames/{frame_id}/fits/hdus/{hdu_index}/info.json                                 - Image information
//! /frames/{frame_id}/fits/hdus/{hdu_index}/{region}/{size}/{rotation}/{quality}.{format} - Image (307)
//! /examples/dragon/view/{frame_id}/fits/hdus/{hdu_index}                             - Viewer
//! /statuz                                                                            - Liveness
//! /configz                                                                           - Configuration
//! ```

use std::time::Duration;

use axum::{routing::get, Router};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    configz_handler, image_handler, info_handler, statuz_handler, viewer_handler, AppState,
};

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            enable_tracing: true,
        }
    }
}

impl RouterConfig {
    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router.
pub fn create_router(state: AppState, config: RouterConfig) -> Router {
    let cors = build_cors_layer(&config);

    let router = Router::new()
        .route(
            "/frames/{frame_id}/fits/hdus/{hdu_index}/info.json",
            get(info_handler),
        )
        .route(
            "/frames/{frame_id}/fits/hdus/{hdu_index}/{region}/{size}/{rotation}/{quality_format}",
            get(image_handler),
        )
        .route(
            "/examples/dragon/view/{frame_id}/fits/hdus/{hdu_index}",
            get(viewer_handler),
        )
        .route("/statuz", get(statuz_handler))
        .route("/configz", get(configz_handler))
        .with_state(state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert!(config.cors_origins.is_none());
        assert!(config.enable_tracing);
    }

    #[test]
    fn test_router_config_builder() {
        let config = RouterConfig::default()
            .with_cors_origins(vec!["https://example.com".to_string()])
            .with_tracing(false);

        assert_eq!(
            config.cors_origins,
            Some(vec!["https://example.com".to_string()])
        );
        assert!(!config.enable_tracing);
    }
}
