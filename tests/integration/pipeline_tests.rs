//! Pipeline integration tests.
//!
//! Drive the dimensions and image pipelines through the public API and check
//! the side effects on the archive, the frame cache and the object store.

use fits_iiif::pipeline::image_workflow_id;
use fits_iiif::{FrameRequest, ImageInfo, ImageRequest, NormalizedRequest};

use super::test_utils::create_test_server;

fn request(width: u32, height: u32, region: &str, size: &str, format: &str) -> NormalizedRequest {
    ImageRequest::parse(region, size, "0", &format!("default.{}", format))
        .unwrap()
        .normalize(&ImageInfo::native(width, height))
        .unwrap()
}

// =============================================================================
// Frame Cache Flags
// =============================================================================

#[tokio::test]
async fn test_force_download_fetches_again() {
    let server = create_test_server(32, 32);

    let dims = server
        .pipelines
        .frame_dimensions(&FrameRequest::new("9", 1))
        .await
        .unwrap();
    assert_eq!((dims.width, dims.height), (32, 32));
    assert_eq!(server.archive.download_count(), 1);

    let mut forced = FrameRequest::new("9", 1);
    forced.reuse_workflow = false;
    forced.force_download = true;
    server.pipelines.frame_dimensions(&forced).await.unwrap();

    assert_eq!(server.archive.download_count(), 2);
}

#[tokio::test]
async fn test_recheck_version_keeps_known_version() {
    let server = create_test_server(32, 32);

    server
        .pipelines
        .frame_dimensions(&FrameRequest::new("9", 1))
        .await
        .unwrap();

    let mut recheck = FrameRequest::new("9", 1);
    recheck.reuse_workflow = false;
    recheck.recheck_version = true;
    server.pipelines.frame_dimensions(&recheck).await.unwrap();

    // The archive is asked again but reports the version already on disk
    assert_eq!(server.archive.lookup_count(), 2);
    assert_eq!(server.archive.download_count(), 1);
}

#[tokio::test]
async fn test_frames_are_cached_per_id() {
    let server = create_test_server(32, 32);

    for id in ["1", "2"] {
        server
            .pipelines
            .frame_dimensions(&FrameRequest::new(id, 1))
            .await
            .unwrap();
    }
    server
        .pipelines
        .frame_dimensions(&FrameRequest::new("1", 1))
        .await
        .unwrap();

    assert_eq!(server.archive.download_count(), 2);
}

// =============================================================================
// Image Pipeline
// =============================================================================

#[tokio::test]
async fn test_multipart_upload_splits_large_images() {
    let server = create_test_server(256, 256);
    let normalized = request(256, 256, "full", "max", "png");

    let key = server
        .pipelines
        .create_image(&FrameRequest::new("9", 1), &normalized)
        .await
        .unwrap();

    let object = server.store.object(&key).await.unwrap();
    // Test servers upload in 4 KiB parts
    assert_eq!(
        server.store.part_upload_count(),
        object.len().div_ceil(4096)
    );
    assert!(server.store.part_upload_count() > 1);
    assert_eq!(server.store.completed_count(), 1);
    assert_eq!(server.store.open_uploads().await, 0);
    assert_eq!(server.generated_files(), 0);
}

#[tokio::test]
async fn test_disabled_reuse_regenerates_same_key() {
    let server = create_test_server(64, 64);
    let normalized = request(64, 64, "0,0,32,32", "16,16", "jpg");

    let first = server
        .pipelines
        .create_image(&FrameRequest::new("9", 1), &normalized)
        .await
        .unwrap();

    let mut fresh = FrameRequest::new("9", 1);
    fresh.reuse_workflow = false;
    let second = server
        .pipelines
        .create_image(&fresh, &normalized)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(server.store.created_count(), 2);
    assert_eq!(server.archive.download_count(), 1);
}

#[tokio::test]
async fn test_failed_part_upload_is_retried() {
    let server = create_test_server(64, 64);
    server.store.fail_part_uploads(1).await;

    let normalized = request(64, 64, "full", "max", "png");
    let key = server
        .pipelines
        .create_image(&FrameRequest::new("9", 1), &normalized)
        .await
        .unwrap();

    let object = server.store.object(&key).await.unwrap();
    assert_eq!(
        server.store.part_upload_count(),
        object.len().div_ceil(4096) + 1
    );
    assert_eq!(server.store.completed_count(), 1);
    assert_eq!(server.store.aborted_count(), 0);
}

#[tokio::test]
async fn test_missing_hdu_is_not_retried() {
    let server = create_test_server(16, 16);
    let normalized = request(16, 16, "full", "max", "jpg");

    let result = server
        .pipelines
        .create_image(&FrameRequest::new("9", 4), &normalized)
        .await;

    assert!(result.is_err());
    assert!(!result.unwrap_err().is_transient());
    assert_eq!(server.store.created_count(), 0);
    assert_eq!(server.generated_files(), 0);
}

#[tokio::test]
async fn test_cancel_during_upload_cleans_up() {
    let server = create_test_server(256, 256);
    server.store.hold_part_uploads(1).await;
    let normalized = request(256, 256, "full", "max", "png");

    let running = tokio::spawn({
        let pipelines = server.pipelines.clone();
        async move {
            pipelines
                .create_image(&FrameRequest::new("9", 1), &normalized)
                .await
        }
    });
    server.store.held().await;

    let workflow_id = image_workflow_id("9", 1, &normalized);
    assert!(server.pipelines.engine().cancel(&workflow_id).await);

    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(server.store.created_count(), 1);
    assert_eq!(server.store.completed_count(), 0);
    assert_eq!(server.store.aborted_count(), 1);
    assert_eq!(server.store.open_uploads().await, 0);
    assert_eq!(server.generated_files(), 0);
}
