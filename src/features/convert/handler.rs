use std::convert::Infallible;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Multipart, Query, State, multipart::MultipartRejection, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::error::AppError;
use crate::features::art::RenderOptions;
use crate::state::AppState;

use super::service::SingleOutcome;
use super::stream::{AbortReason, StreamOutcome};
use super::types::ConvertQuery;

/// 上传文件所在的 multipart 字段名
const IMAGE_FIELD: &str = "image";

/// 缓存命中标记头
pub const X_CACHE: &str = "x-cache";

fn resolve_options(
    state: &AppState,
    query: Result<Query<ConvertQuery>, QueryRejection>,
) -> Result<RenderOptions, AppError> {
    let Query(q) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    q.resolve(state.converter.settings())
}

/// 读取 `image` 字段；其它字段忽略
async fn read_upload(multipart: Result<Multipart, MultipartRejection>) -> Result<Bytes, AppError> {
    let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            let data = field.bytes().await?;
            if data.is_empty() {
                break;
            }
            return Ok(data);
        }
    }
    Err(AppError::MissingFile(format!(
        "multipart 字段 `{IMAGE_FIELD}` 为必填"
    )))
}

fn text_response(text: Bytes, cache_state: &'static str) -> Response {
    let mut res = (StatusCode::OK, text).into_response();
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CACHE, HeaderValue::from_static(cache_state));
    res
}

#[utoipa::path(
    post,
    path = "/convert",
    summary = "静态图转字符画",
    description = "上传一张图片（multipart 字段 image），返回字符画文本。命中缓存时响应头带 X-Cache: HIT；等待超时返回 408 SERVER_BUSY，可稍后重试。",
    request_body(content = crate::features::convert::types::ImageUpload, content_type = "multipart/form-data"),
    params(
        ("width" = Option<u32>, Query, description = "输出列数，默认 180；0 表示按 height 推导"),
        ("height" = Option<u32>, Query, description = "输出行数，默认 0（按原图比例推导）"),
        ("mode" = Option<String>, Query, description = "输出模式：plain|ansi，默认 plain")
    ),
    responses(
        (status = 200, description = "字符画文本", body = String, content_type = "text/plain"),
        (status = 400, description = "缺少上传文件或请求格式错误", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 408, description = "服务繁忙（等待转换超时）", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 413, description = "上传体积或解码尺寸超限", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 415, description = "无法解码的图片", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 422, description = "参数校验失败", body = crate::error::ProblemDetails, content_type = "application/problem+json")
    ),
    tag = "Convert"
)]
pub async fn convert_image(
    State(state): State<AppState>,
    query: Result<Query<ConvertQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let opts = resolve_options(&state, query)?;
    let upload = read_upload(multipart).await?;

    let cancel = CancellationToken::new();
    // 客户端断开时 axum 丢弃本 future，守卫随之触发取消，尚未开始的任务跳过转换
    let guard = cancel.clone().drop_guard();
    let outcome = state.converter.convert_single(upload, opts, &cancel).await;
    guard.disarm();

    match outcome? {
        SingleOutcome::Cached(text) => Ok(text_response(text, "HIT")),
        SingleOutcome::Converted(text) => Ok(text_response(text, "MISS")),
        SingleOutcome::Busy => {
            warn!(
                timeout_secs = state.converter.settings().timeout_secs,
                "等待转换结果超时，返回服务繁忙"
            );
            Err(AppError::Busy)
        }
        // 令牌只由上面的守卫触发，而守卫触发时本 future 已被丢弃，这里仅为穷尽匹配
        SingleOutcome::Abandoned => Err(AppError::Internal("请求已被取消".to_string())),
    }
}

#[utoipa::path(
    post,
    path = "/stream",
    summary = "动图逐帧推送",
    description = "上传 GIF 或动态 WebP（multipart 字段 image），以 text/event-stream 按原始帧序逐帧推送。每条记录为 `data: ` + ESC[H + 帧文本 + 空行，写出后按该帧 delay 停顿。",
    request_body(content = crate::features::convert::types::ImageUpload, content_type = "multipart/form-data"),
    params(
        ("width" = Option<u32>, Query, description = "输出列数，默认 180；0 表示按 height 推导"),
        ("height" = Option<u32>, Query, description = "输出行数，默认 0（按原图比例推导）"),
        ("mode" = Option<String>, Query, description = "输出模式：plain|ansi，默认 plain")
    ),
    responses(
        (status = 200, description = "逐帧记录流", body = String, content_type = "text/event-stream"),
        (status = 400, description = "缺少上传文件或动图无法解码", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 413, description = "上传体积超限", body = crate::error::ProblemDetails, content_type = "application/problem+json"),
        (status = 422, description = "参数校验失败", body = crate::error::ProblemDetails, content_type = "application/problem+json")
    ),
    tag = "Convert"
)]
pub async fn stream_animation(
    State(state): State<AppState>,
    query: Result<Query<ConvertQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let opts = resolve_options(&state, query)?;
    let upload = read_upload(multipart).await?;

    let frames = state.converter.prepare_animation(upload, opts).await?;
    let total = frames.len();
    info!(frames = total, width = opts.width, mode = opts.mode.as_str(), "开始推送动图");

    // 容量为 1：每帧写出后即交给 hyper 发送，不在服务端堆积
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    let converter = state.converter.clone();
    tokio::spawn(
        async move {
            match converter
                .stream_frames(frames, opts, tx, CancellationToken::new())
                .await
            {
                StreamOutcome::Completed { frames } => info!(frames, "动图推送完成"),
                StreamOutcome::Aborted {
                    written,
                    reason: AbortReason::ClientGone,
                } => info!(written, total, "客户端断开，停止推送"),
                StreamOutcome::Aborted {
                    written,
                    reason: AbortReason::FrameLost { index },
                } => warn!(written, index, "帧转换失败，提前结束推送"),
            }
        }
        .instrument(tracing::Span::current()),
    );

    // 响应体被丢弃（客户端断开）时 rx 随之释放，推送循环经 sink.closed() 感知
    let records = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|record| (Ok::<_, Infallible>(record), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(records))
        .map_err(|e| AppError::Internal(format!("构造推送响应失败: {e}")))
}

pub fn create_convert_router() -> Router<AppState> {
    Router::new()
        .route("/convert", post(convert_image))
        .route("/stream", post(stream_animation))
}
