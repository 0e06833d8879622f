#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, header},
};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageFormat, Rgba, RgbaImage};

use rune_engine::config::AppConfig;
use rune_engine::features::convert::{ConversionService, ResultCache};
use rune_engine::{AppState, WorkerPool, app};

pub const BOUNDARY: &str = "rune-test-boundary";

/// 用给定配置装配完整应用（必须在 tokio 运行时内调用）
pub fn build_app(config: &AppConfig) -> (Router, Arc<WorkerPool>) {
    let pool = Arc::new(
        WorkerPool::start(config.pool.effective_workers(), config.pool.queue_capacity)
            .expect("start pool"),
    );
    let converter = ConversionService::new(
        pool.clone(),
        ResultCache::new(&config.cache),
        config.convert.clone(),
    );
    (app::build_router(AppState::new(converter), config), pool)
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pool.workers = 2;
    config.pool.queue_capacity = 16;
    config
}

/// 手工拼一个只含单个文件字段的 multipart 请求体
pub fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(field, "upload.bin", bytes)))
        .expect("build request")
}

pub fn solid_png(w: u32, h: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(w, h, Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

/// 每帧纯色的 GIF，delay 单位为 1/100 秒
pub fn solid_gif(w: u32, h: u32, colors: &[[u8; 4]], delay_cs: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).expect("set repeat");
        for rgba in colors {
            let frame = Frame::from_parts(
                RgbaImage::from_pixel(w, h, Rgba(*rgba)),
                0,
                0,
                Delay::from_numer_denom_ms(delay_cs * 10, 1),
            );
            encoder.encode_frame(frame).expect("encode frame");
        }
    }
    out
}
