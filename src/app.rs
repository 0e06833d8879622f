//! 路由与中间件装配

use axum::{Json, Router, extract::DefaultBodyLimit, routing::get};
use tower_http::compression::CompressionLayer;
use utoipa::OpenApi;

use crate::config::AppConfig;
use crate::cors::build_cors_layer;
use crate::features::{convert, health};
use crate::openapi::ApiDoc;
use crate::request_id::request_id_middleware;
use crate::state::AppState;

/// 应用内响应压缩：排除不该压缩的响应。
///
/// - SSE：压缩会引入缓冲，逐帧推送的节奏就无法到达客户端
/// - 图片/音视频与常见二进制下载：本身已压缩，收益极低
pub fn compression_predicate() -> impl tower_http::compression::predicate::Predicate {
    use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};

    SizeAbove::default()
        .and(NotForContentType::GRPC)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::SSE)
        .and(NotForContentType::const_new("application/octet-stream"))
        .and(NotForContentType::const_new("video/"))
        .and(NotForContentType::const_new("audio/"))
}

/// 组装完整路由：业务接口挂在 `api.prefix` 下，OpenAPI 文档在根路径
pub fn build_router(state: AppState, config: &AppConfig) -> Router {
    let api_router = Router::<AppState>::new()
        .merge(health::create_health_router())
        .merge(convert::create_convert_router())
        .layer(DefaultBodyLimit::max(config.convert.max_upload_bytes));

    let prefix = config.api.prefix.trim_end_matches('/');
    let mounted = if prefix.is_empty() {
        Router::<AppState>::new().merge(api_router)
    } else {
        Router::<AppState>::new().nest(prefix, api_router)
    };

    let mut app = mounted
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .with_state(state);

    if let Some(cors) = build_cors_layer(&config.cors) {
        app = app.layer(cors);
    }

    app.layer(CompressionLayer::new().compress_when(compression_predicate()))
        .layer(axum::middleware::from_fn(request_id_middleware))
}
