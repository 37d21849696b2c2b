//! Test utilities for integration tests.
//!
//! Provides a FITS file builder, an in-process archive and a router wired
//! to an in-memory object store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;

use fits_iiif::archive::{Download, FrameVersion};
use fits_iiif::engine::{Engine, InMemoryStepLog, Workers};
use fits_iiif::{
    Activities, AppState, ArchiveClient, ArchiveError, FrameCache, InMemoryObjectStore,
    LocalAffinity, Pipelines, RetryShell, RouterConfig, WorkerAffinityToken, create_router,
};

// =============================================================================
// FITS Builder
// =============================================================================

const BLOCK: usize = 2880;

fn card(keyword: &str, value: &str) -> String {
    format!("{:<80}", format!("{:<8}= {:>20}", keyword, value))
}

fn header(cards: &[String]) -> Vec<u8> {
    let mut text = cards.concat();
    text.push_str(&format!("{:<80}", "END"));
    let mut bytes = text.into_bytes();
    bytes.resize(bytes.len().div_ceil(BLOCK) * BLOCK, b' ');
    bytes
}

/// A FITS file with an empty primary HDU and one 16-bit IMAGE extension
/// (HDU 1) of `width` x `height` pixels.
pub fn create_fits_frame(width: usize, height: usize) -> Vec<u8> {
    let mut bytes = header(&[
        card("SIMPLE", "T"),
        card("BITPIX", "8"),
        card("NAXIS", "0"),
        card("EXTEND", "T"),
    ]);
    bytes.extend(header(&[
        card("XTENSION", "'IMAGE   '"),
        card("BITPIX", "16"),
        card("NAXIS", "2"),
        card("NAXIS1", &width.to_string()),
        card("NAXIS2", &height.to_string()),
        card("PCOUNT", "0"),
        card("GCOUNT", "1"),
    ]));

    let mut data: Vec<u8> = (0..width * height)
        .flat_map(|i| (((i * 7919) % 1021) as i16).to_be_bytes())
        .collect();
    data.resize(data.len().div_ceil(BLOCK) * BLOCK, 0);
    bytes.extend(data);
    bytes
}

/// Check that data starts with the PNG signature.
pub fn is_valid_png(data: &[u8]) -> bool {
    data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
}

/// Check that data starts with a JPEG SOI marker.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8
}

// =============================================================================
// Mock Archive
// =============================================================================

/// An archive holding a single file served for every frame id.
pub struct MockArchive {
    body: Bytes,
    version_id: String,
    lookups: AtomicUsize,
    downloads: AtomicUsize,
}

impl MockArchive {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Bytes::from(body),
            version_id: "v1".to_string(),
            lookups: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveClient for MockArchive {
    fn base_url(&self) -> &str {
        "http://archive.test/"
    }

    async fn frame_version(&self, frame_id: &str) -> Result<FrameVersion, ArchiveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(FrameVersion {
            basename: format!("frame-{}", frame_id),
            version_id: self.version_id.clone(),
            extension: ".fits".to_string(),
            url: format!("http://archive.test/files/{}", frame_id),
        })
    }

    async fn download(&self, _url: &str) -> Result<Download, ArchiveError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        // Two chunks so the cache sees a streamed body
        let mid = self.body.len() / 2;
        let chunks = vec![Ok(self.body.slice(..mid)), Ok(self.body.slice(mid..))];
        Ok(Download {
            total: Some(self.body.len() as u64),
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }
}

// =============================================================================
// Test Server
// =============================================================================

/// Everything a test needs to drive the router and inspect side effects.
pub struct TestServer {
    pub router: Router,
    pub pipelines: Pipelines,
    pub archive: Arc<MockArchive>,
    pub store: Arc<InMemoryObjectStore>,
    pub dir: tempfile::TempDir,
}

impl TestServer {
    /// Number of files left in the scratch directory for encoded images.
    pub fn generated_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("generated"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Build a server whose archive serves a `width` x `height` frame.
pub fn create_test_server(width: usize, height: usize) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(MockArchive::new(create_fits_frame(width, height)));
    let store = Arc::new(InMemoryObjectStore::new());
    let token = WorkerAffinityToken::from("worker/integration");

    let engine = Engine::new(
        Arc::new(InMemoryStepLog::new()),
        Workers::new(token.clone(), 8),
        100,
    );
    let activities = Activities::new(
        FrameCache::new(archive.clone(), dir.path()),
        store.clone(),
        Arc::new(LocalAffinity::new(token)),
        dir.path(),
    );
    let pipelines = Pipelines::new(engine, Arc::new(activities), RetryShell::default())
        .with_part_size(4096);

    let state = AppState::new(pipelines.clone(), store.clone(), Duration::from_secs(300))
        .with_config(serde_json::json!({ "worker_slots": 8 }));
    let router = create_router(state, RouterConfig::default().with_tracing(false));

    TestServer {
        router,
        pipelines,
        archive,
        store,
        dir,
    }
}
