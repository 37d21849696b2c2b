//! fits-iiif - An IIIF image server for FITS frames.
//!
//! This binary starts the HTTP server and wires the workflow engine,
//! frame cache and object store together.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fits_iiif::{
    affinity::{LocalAffinity, WorkerAffinityToken},
    archive::HttpArchiveClient,
    cache::FrameCache,
    config::Config,
    engine::{Engine, FileStepLog, Workers},
    pipeline::{Activities, Pipelines},
    server::{create_router, AppState, RouterConfig},
    store::{create_s3_client, InMemoryObjectStore, ObjectStore, S3ObjectStore},
};

/// How long running workflows get to finish their cleanup on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    log_config(&config);

    let token = match WorkerAffinityToken::load_or_create(&config.working_dir) {
        Ok(token) => token,
        Err(e) => {
            error!(
                "Failed to initialise worker token in {}: {}",
                config.working_dir.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };
    info!("  Worker token: {}", token);

    let http = reqwest::Client::new();
    let store = build_store(&config, http.clone()).await;
    let archive = Arc::new(HttpArchiveClient::new(http, &config.archive_api));

    let engine = Engine::new(
        Arc::new(FileStepLog::new(config.working_dir.join("history"))),
        Workers::new(token.clone(), config.worker_slots),
        config.result_cache,
    );

    let activities = Activities::new(
        FrameCache::new(archive, &config.working_dir),
        store.clone(),
        Arc::new(LocalAffinity::new(token)),
        &config.working_dir,
    );
    if let Err(e) = activities.sweep_generated().await {
        warn!("Failed to sweep generated images: {}", e);
    }
    let pipelines = Pipelines::new(engine.clone(), Arc::new(activities), config.retry_shell());

    let state = AppState::new(pipelines, store, config.presign_ttl()).with_config(config.to_json());
    let router = create_router(state, build_router_config(&config));

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/statuz", addr);
    info!("    curl http://{}/frames/<frame_id>/fits/hdus/1/info.json", addr);
    info!("");
    info!("  View a frame in your browser:");
    info!("    open http://{}/examples/dragon/view/<frame_id>/fits/hdus/1", addr);
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    // Runs are cancelled as soon as the signal arrives, so requests waiting
    // on them finish and the connections can drain
    let signal_engine = engine.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down, cancelling running workflows");
            signal_engine.cancel_all();
        })
        .await;

    engine.shutdown(SHUTDOWN_GRACE).await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn log_config(config: &Config) {
    info!("fits-iiif v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Archive API: {}", config.archive_api);
    info!("  Working dir: {}", config.working_dir.display());
    if config.in_memory_store {
        warn!("  Store: IN-MEMORY - redirect targets are not fetchable");
    } else {
        info!("  S3 bucket: {}", config.s3_bucket);
        if let Some(ref endpoint) = config.s3_endpoint {
            info!("  S3 endpoint: {}", endpoint);
        }
        info!("  S3 region: {}", config.s3_region);
    }
    info!(
        "  Workers: {} slots, restart after {}s on {:?} failures",
        config.worker_slots, config.retry_delay, config.retry_scope
    );
}

async fn build_store(config: &Config, http: reqwest::Client) -> Arc<dyn ObjectStore> {
    if config.in_memory_store {
        return Arc::new(InMemoryObjectStore::new());
    }

    let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
    Arc::new(S3ObjectStore::new(client, config.s3_bucket.clone(), http))
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "fits_iiif=debug,tower_http=debug"
    } else {
        "fits_iiif=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_router_config(config: &Config) -> RouterConfig {
    let mut router_config = RouterConfig::default().with_tracing(!config.no_tracing);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

