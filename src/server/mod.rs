//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   GET /frames/{id}/fits/hdus/{hdu}/info.json                    │
//! │   GET /frames/{id}/fits/hdus/{hdu}/{region}/{size}/0/default.*  │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │   viewer    │  │        routes           │  │
//! │  │ (requests)  │  │(OpenSeadragon)│ │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                  pipeline::Pipelines (durable runs)
//! ```

pub mod handlers;
pub mod routes;
pub mod viewer;

pub use handlers::{
    configz_handler, image_handler, info_handler, statuz_handler, viewer_handler, AppState,
    ErrorResponse, FramePathParams, ImagePathParams, PipelineQueryParams,
};
pub use routes::{create_router, RouterConfig};
