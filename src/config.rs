//! Configuration management for the IIIF server.
//!
//! Options come from command-line arguments or environment variables with
//! the `FITS_IIIF_` prefix:
//!
//! - `FITS_IIIF_HOST` - Server bind address (default: 0.0.0.0)
//! - `FITS_IIIF_PORT` - Server port (default: 8000)
//! - `FITS_IIIF_ARCHIVE_API` - Base URL of the frame archive API (required)
//! - `FITS_IIIF_WORKING_DIR` - Scratch space for frames, images and history (default: /tmp)
//! - `FITS_IIIF_S3_BUCKET` - Bucket generated images are stored in (default: fits-iiif)
//! - `FITS_IIIF_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `FITS_IIIF_S3_REGION` - AWS region (default: us-east-1)
//! - `FITS_IIIF_PRESIGN_TTL` - Lifetime of redirect URLs in seconds (default: 300)
//! - `FITS_IIIF_WORKER_SLOTS` - Concurrent steps per worker (default: 20)
//! - `FITS_IIIF_RETRY_DELAY` - Seconds before a failed pipeline restarts (default: 5)
//! - `FITS_IIIF_RETRY_SCOPE` - Failures that restart a pipeline: transient or all
//! - `FITS_IIIF_RESULT_CACHE` - Completed workflow outputs kept in memory (default: 10000)
//!
//! S3 credentials are resolved through the standard AWS provider chain.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use url::Url;

use crate::engine::DEFAULT_RESULT_CACHE_CAPACITY;
use crate::pipeline::{RetryScope, RetryShell};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default bucket for generated images.
pub const DEFAULT_BUCKET: &str = "fits-iiif";

/// Default lifetime of presigned redirect URLs (5 minutes).
pub const DEFAULT_PRESIGN_TTL: u64 = 300;

/// Default number of concurrent steps per worker.
pub const DEFAULT_WORKER_SLOTS: usize = 20;

/// Default pipeline restart delay in seconds.
pub const DEFAULT_RETRY_DELAY: u64 = 5;

// =============================================================================
// CLI Arguments
// =============================================================================

/// fits-iiif - An IIIF image server for FITS frames.
///
/// Generates crops and rescales of archive frames on demand and serves them
/// from S3 or S3-compatible storage.
#[derive(Parser, Serialize, Debug, Clone)]
#[command(name = "fits-iiif")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "FITS_IIIF_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "FITS_IIIF_PORT")]
    pub port: u16,

    // =========================================================================
    // Archive and Worker Configuration
    // =========================================================================
    /// Base URL of the frame archive API.
    #[arg(long, env = "FITS_IIIF_ARCHIVE_API")]
    pub archive_api: Url,

    /// Scratch space for downloaded frames, generated images and workflow history.
    #[arg(long, default_value = "/tmp", env = "FITS_IIIF_WORKING_DIR")]
    pub working_dir: PathBuf,

    /// Number of steps a worker runs concurrently.
    #[arg(long, default_value_t = DEFAULT_WORKER_SLOTS, env = "FITS_IIIF_WORKER_SLOTS")]
    pub worker_slots: usize,

    /// Seconds to wait before restarting a failed pipeline.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY, env = "FITS_IIIF_RETRY_DELAY")]
    pub retry_delay: u64,

    /// Which pipeline failures trigger a restart.
    #[arg(long, value_enum, default_value_t = RetryScope::Transient, env = "FITS_IIIF_RETRY_SCOPE")]
    pub retry_scope: RetryScope,

    /// Number of completed workflow outputs kept in memory.
    #[arg(long, default_value_t = DEFAULT_RESULT_CACHE_CAPACITY, env = "FITS_IIIF_RESULT_CACHE")]
    pub result_cache: usize,

    // =========================================================================
    // S3 Configuration
    // =========================================================================
    /// S3 bucket generated images are uploaded to.
    #[arg(long, default_value = DEFAULT_BUCKET, env = "FITS_IIIF_S3_BUCKET")]
    pub s3_bucket: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    ///
    /// If not specified, uses the default AWS S3 endpoint.
    #[arg(long, env = "FITS_IIIF_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "FITS_IIIF_S3_REGION")]
    pub s3_region: String,

    /// Lifetime in seconds of the presigned URLs image requests redirect to.
    #[arg(long, default_value_t = DEFAULT_PRESIGN_TTL, env = "FITS_IIIF_PRESIGN_TTL")]
    pub presign_ttl: u64,

    /// Keep generated images in process memory instead of S3.
    ///
    /// Redirect targets are not fetchable; for local runs only.
    #[arg(long, default_value_t = false, env = "FITS_IIIF_IN_MEMORY_STORE")]
    pub in_memory_store: bool,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "FITS_IIIF_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.archive_api.scheme(), "http" | "https") {
            return Err(format!(
                "archive_api must be an http(s) URL, got {}",
                self.archive_api
            ));
        }

        if self.s3_bucket.is_empty() && !self.in_memory_store {
            return Err(
                "S3 bucket name is required. Set --s3-bucket or FITS_IIIF_S3_BUCKET".to_string(),
            );
        }

        if self.worker_slots == 0 {
            return Err("worker_slots must be greater than 0".to_string());
        }
        if self.result_cache == 0 {
            return Err("result_cache must be greater than 0".to_string());
        }

        // S3 presigned URLs are valid for at most 7 days
        if self.presign_ttl == 0 || self.presign_ttl > 7 * 24 * 3600 {
            return Err("presign_ttl must be between 1 second and 7 days".to_string());
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl)
    }

    /// Outer restart policy for both pipelines.
    pub fn retry_shell(&self) -> RetryShell {
        RetryShell::new(Duration::from_secs(self.retry_delay), self.retry_scope)
    }

    /// The configuration as served by `/configz`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            archive_api: Url::parse("https://archive-api.example.org/").unwrap(),
            working_dir: PathBuf::from("/tmp"),
            worker_slots: DEFAULT_WORKER_SLOTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_scope: RetryScope::Transient,
            result_cache: 100,
            s3_bucket: "test-bucket".to_string(),
            s3_endpoint: None,
            s3_region: "us-west-2".to_string(),
            presign_ttl: DEFAULT_PRESIGN_TTL,
            in_memory_store: false,
            cors_origins: None,
            verbose: false,
            no_tracing: false,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_parse_from_args() {
        let config = Config::try_parse_from([
            "fits-iiif",
            "--archive-api",
            "https://archive-api.example.org/",
            "--retry-scope",
            "all",
        ])
        .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.s3_bucket, DEFAULT_BUCKET);
        assert_eq!(config.retry_scope, RetryScope::All);
        assert_eq!(config.presign_ttl(), Duration::from_secs(300));
        assert_eq!(config.retry_shell().delay, Duration::from_secs(5));
    }

    #[test]
    fn test_archive_api_scheme() {
        let mut config = test_config();
        config.archive_api = Url::parse("ftp://archive.example.org/").unwrap();

        let result = config.validate();
        assert!(result.unwrap_err().contains("archive_api"));
    }

    #[test]
    fn test_empty_bucket() {
        let mut config = test_config();
        config.s3_bucket = String::new();
        assert!(config.validate().unwrap_err().contains("bucket"));

        config.in_memory_store = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let mut config = test_config();
        config.worker_slots = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.presign_ttl = 8 * 24 * 3600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(test_config().bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_config_json() {
        let json = test_config().to_json();
        assert_eq!(json["archive_api"], "https://archive-api.example.org/");
        assert_eq!(json["retry_scope"], "transient");
        assert_eq!(json["worker_slots"], 20);
    }
}
