//! API integration tests for the IIIF endpoints.
//!
//! Tests verify:
//! - `info.json` documents and their ids
//! - Image redirects and the uploaded objects behind them
//! - Error status codes for malformed and unsupported requests
//! - The viewer, liveness and configuration endpoints

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::test_utils::{create_test_server, is_valid_jpeg, is_valid_png};

async fn get(router: &axum::Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn object_key(location: &str) -> String {
    location
        .strip_prefix("memory://objects/")
        .and_then(|rest| rest.split('?').next())
        .unwrap()
        .to_string()
}

// =============================================================================
// Image Information
// =============================================================================

#[tokio::test]
async fn test_info_json() {
    let server = create_test_server(300, 200);

    let response = get(&server.router, "/frames/42/fits/hdus/1/info.json").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["@context"], "http://iiif.io/api/image/3/context.json");
    assert_eq!(json["id"], "http://localhost:8000/frames/42/fits/hdus/1");
    assert_eq!(json["type"], "ImageService3");
    assert_eq!(json["protocol"], "http://iiif.io/api/image");
    assert_eq!(json["profile"], "level1");
    assert_eq!(json["width"], 300);
    assert_eq!(json["height"], 200);
    assert_eq!(json["maxWidth"], 300);
    assert_eq!(json["maxHeight"], 200);
    assert!(json.get("maxArea").is_none());
    assert_eq!(json["tiles"][0]["width"], 512);
    assert_eq!(json["tiles"][0]["scaleFactors"].as_array().unwrap().len(), 19);
}

#[tokio::test]
async fn test_info_json_id_follows_forwarded_host() {
    let server = create_test_server(16, 16);

    let request = Request::builder()
        .uri("/frames/42/fits/hdus/1/info.json")
        .header("host", "iiif.example.org")
        .header("x-forwarded-proto", "https")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    let json = json_body(response).await;
    assert_eq!(json["id"], "https://iiif.example.org/frames/42/fits/hdus/1");
}

#[tokio::test]
async fn test_info_json_reuses_completed_run() {
    let server = create_test_server(16, 16);

    for _ in 0..3 {
        let response = get(&server.router, "/frames/7/fits/hdus/1/info.json").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(server.archive.download_count(), 1);
    assert_eq!(server.archive.lookup_count(), 1);
}

#[tokio::test]
async fn test_info_json_primary_hdu_without_image() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/frames/42/fits/hdus/0/info.json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_request");
}

#[tokio::test]
async fn test_info_json_invalid_hdu_index() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/frames/42/fits/hdus/first/info.json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_path");
    assert_eq!(server.archive.lookup_count(), 0);
}

// =============================================================================
// Image Requests
// =============================================================================

#[tokio::test]
async fn test_image_redirects_to_uploaded_png() {
    let server = create_test_server(300, 200);

    let response = get(
        &server.router,
        "/frames/42/fits/hdus/1/0,0,100,100/50,/0/default.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("memory://objects/generated/"));
    assert!(location.ends_with("?expires=300"));

    let key = object_key(&location);
    let object = server.store.object(&key).await.unwrap();
    assert!(is_valid_png(&object));

    let decoded = image::load_from_memory(&object).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (50, 50));
    assert_eq!(
        server.store.content_type(&key).await.as_deref(),
        Some("image/png")
    );
    assert_eq!(server.generated_files(), 0);
}

#[tokio::test]
async fn test_image_full_max_jpeg() {
    let server = create_test_server(120, 80);

    let response = get(&server.router, "/frames/42/fits/hdus/1/full/max/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response.headers().get("location").unwrap().to_str().unwrap();
    let object = server.store.object(&object_key(location)).await.unwrap();
    assert!(is_valid_jpeg(&object));

    let decoded = image::load_from_memory(&object).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (120, 80));
}

#[tokio::test]
async fn test_equivalent_requests_share_object() {
    let server = create_test_server(64, 64);

    let first = get(&server.router, "/frames/42/fits/hdus/1/full/64,/0/default.png").await;
    let second = get(
        &server.router,
        "/frames/42/fits/hdus/1/0,0,64,64/max/0/default.png",
    )
    .await;

    assert_eq!(
        first.headers().get("location"),
        second.headers().get("location")
    );
    // Both normalize to the same request, so the second reuses the first run
    assert_eq!(server.store.created_count(), 1);
}

#[tokio::test]
async fn test_image_upscaling_not_implemented() {
    let server = create_test_server(64, 64);

    let response = get(&server.router, "/frames/42/fits/hdus/1/full/^max/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

    let json = json_body(response).await;
    assert_eq!(json["error"], "upscaling_unsupported");
    assert_eq!(server.store.created_count(), 0);
}

#[tokio::test]
async fn test_image_unsupported_rotation() {
    let server = create_test_server(64, 64);

    let response = get(&server.router, "/frames/42/fits/hdus/1/full/max/90/default.jpg").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "unsupported_rotation");
}

#[tokio::test]
async fn test_image_unsupported_format() {
    let server = create_test_server(64, 64);

    let response = get(&server.router, "/frames/42/fits/hdus/1/full/max/0/default.tif").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "unsupported_format");
}

#[tokio::test]
async fn test_image_region_out_of_bounds() {
    let server = create_test_server(64, 64);

    let response = get(
        &server.router,
        "/frames/42/fits/hdus/1/100,100,10,10/max/0/default.jpg",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "region_out_of_bounds");
    assert_eq!(server.store.created_count(), 0);
}

#[tokio::test]
async fn test_image_size_exceeds_max() {
    let server = create_test_server(64, 64);

    let response = get(&server.router, "/frames/42/fits/hdus/1/full/128,/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "size_constraint");
}

#[tokio::test]
async fn test_shutdown_releases_waiting_request() {
    let server = create_test_server(64, 64);
    server.store.hold_completions(1).await;

    let pending = tokio::spawn({
        let router = server.router.clone();
        async move { get(&router, "/frames/42/fits/hdus/1/full/max/0/default.png").await }
    });
    server.store.held().await;

    server.pipelines.engine().cancel_all();

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["error"], "cancelled");
    assert_eq!(server.store.aborted_count(), 1);
    assert_eq!(server.generated_files(), 0);
}

// =============================================================================
// Viewer and Service Endpoints
// =============================================================================

#[tokio::test]
async fn test_viewer_page() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/examples/dragon/view/42/fits/hdus/1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/html"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("OpenSeadragon"));
    assert!(html.contains("http://localhost:8000/frames/42/fits/hdus/1/info.json"));
    // The page does not touch the archive
    assert_eq!(server.archive.lookup_count(), 0);
}

#[tokio::test]
async fn test_statuz() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/statuz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!("Ok"));
}

#[tokio::test]
async fn test_configz() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/configz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["worker_slots"], 8);
}

#[tokio::test]
async fn test_unknown_route() {
    let server = create_test_server(16, 16);

    let response = get(&server.router, "/frames/42").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_headers() {
    let server = create_test_server(16, 16);

    let request = Request::builder()
        .uri("/statuz")
        .header("origin", "https://viewer.example.org")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}
