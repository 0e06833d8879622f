mod common;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use tower::ServiceExt;

use common::{build_app, solid_png, test_config, upload_request};

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn solid_white_png_converts_then_hits_cache() {
    let (app, _pool) = build_app(&test_config());
    let png = solid_png(2, 2, [255, 255, 255, 255]);

    let first = app
        .clone()
        .oneshot(upload_request("/v1/convert?width=2&mode=plain", "image", &png))
        .await
        .expect("call /convert");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    assert!(first.headers().get("x-request-id").is_some());
    assert_eq!(body_string(first).await, "@@\n");

    // 缓存写入是后台异步完成的，稍等片刻再查
    let mut hit = None;
    for _ in 0..50 {
        let resp = app
            .clone()
            .oneshot(upload_request("/v1/convert?width=2&mode=plain", "image", &png))
            .await
            .expect("call /convert");
        if resp.headers().get("x-cache").is_some_and(|v| v == "HIT") {
            hit = Some(resp);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let hit = hit.expect("second call should be served from cache");
    assert_eq!(body_string(hit).await, "@@\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ansi_mode_wraps_characters_in_color_escapes() {
    let (app, _pool) = build_app(&test_config());
    let png = solid_png(1, 1, [255, 0, 0, 255]);
    let resp = app
        .oneshot(upload_request(
            "/v1/convert?width=1&height=1&mode=ansi",
            "image",
            &png,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "\x1b[38;2;255;0;0m-\x1b[0m\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_image_field_is_bad_request() {
    let (app, _pool) = build_app(&test_config());
    let resp = app
        .oneshot(upload_request("/v1/convert", "not-image", b"whatever"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["code"], "MISSING_FILE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_multipart_body_is_bad_request() {
    let (app, _pool) = build_app(&test_config());
    let req = Request::builder()
        .method("POST")
        .uri("/v1/convert")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_upload_is_unsupported_media_type() {
    let (app, _pool) = build_app(&test_config());
    let resp = app
        .oneshot(upload_request("/v1/convert", "image", b"this is not an image"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["code"], "UNSUPPORTED_IMAGE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_query_is_validation_error() {
    let (app, _pool) = build_app(&test_config());
    let png = solid_png(2, 2, [0, 0, 0, 255]);

    let resp = app
        .clone()
        .oneshot(upload_request("/v1/convert?width=5000", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = app
        .oneshot(upload_request("/v1/convert?mode=sepia", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_upload_is_rejected() {
    let mut config = test_config();
    config.convert.max_upload_bytes = 1024;
    let (app, _pool) = build_app(&config);
    let resp = app
        .oneshot(upload_request("/v1/convert", "image", &vec![0u8; 4096]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_answers_busy_with_request_timeout() {
    let mut config = test_config();
    config.pool.workers = 1;
    config.convert.timeout_secs = 1;
    let (app, pool) = build_app(&config);

    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    pool.submit(move || {
        let _ = gate_rx.recv();
    })
    .await
    .unwrap();

    let png = solid_png(3, 3, [10, 20, 30, 255]);
    let resp = app
        .oneshot(upload_request("/v1/convert?width=3", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["code"], "SERVER_BUSY");
    gate_tx.send(()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_pool_answers_service_unavailable() {
    let (app, pool) = build_app(&test_config());
    pool.shutdown();
    let png = solid_png(2, 2, [1, 2, 3, 255]);
    let resp = app
        .oneshot(upload_request("/v1/convert?width=2", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_up_with_timestamp() {
    let (app, _pool) = build_app(&test_config());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["status"], "up");
    assert!(json["timestamp"].as_i64().unwrap() > 1_600_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn openapi_document_is_served() {
    let (app, _pool) = build_app(&test_config());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert!(json["paths"]["/convert"].is_object());
    assert!(json["paths"]["/stream"].is_object());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn height_only_request_derives_width_from_aspect() {
    let (app, _pool) = build_app(&test_config());
    // 8x4：列数 = 2 / 0.5 / 0.55 = 7
    let png = solid_png(8, 4, [255, 255, 255, 255]);
    let resp = app
        .oneshot(upload_request("/v1/convert?width=0&height=2", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "@@@@@@@\n@@@@@@@\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn derived_rows_are_bounded_by_max_height() {
    let (app, _pool) = build_app(&test_config());
    // 只给 width 时推导出 100 * 4000 * 0.55 行，需按比例缩进上限
    let png = solid_png(1, 4000, [255, 255, 255, 255]);
    let resp = app
        .oneshot(upload_request("/v1/convert?width=100", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    let rows: Vec<&str> = body.lines().collect();
    assert_eq!(rows.len(), 1000);
    assert!(rows.iter().all(|row| !row.is_empty() && row.len() <= 100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_past_decode_dimension_limit_is_rejected() {
    let mut config = test_config();
    config.convert.max_image_dimension = 64;
    let (app, _pool) = build_app(&config);
    let png = solid_png(1, 500, [255, 255, 255, 255]);
    let resp = app
        .oneshot(upload_request("/v1/convert?width=10", "image", &png))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
