use axum::http::{HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsConfig;

/// 解析后的单项配置：`*` 或显式列表
#[derive(Debug, PartialEq, Eq)]
enum Allow<T> {
    Any,
    List(Vec<T>),
}

impl<T> Allow<T> {
    fn is_any(&self) -> bool {
        matches!(self, Allow::Any)
    }
}

/// 逐项 trim；空项跳过，`*` 视为任意，无法解析的值告警后忽略
fn parse_list<T>(label: &str, values: &[String], parse: impl Fn(&str) -> Option<T>) -> Allow<T> {
    let mut items = Vec::new();
    let mut any = false;
    for value in values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()) {
        if value == "*" {
            any = true;
        } else if let Some(item) = parse(value) {
            items.push(item);
        } else {
            tracing::warn!("CORS {} 含无效值: {}", label, value);
        }
    }
    if any { Allow::Any } else { Allow::List(items) }
}

fn parse_origin(v: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(v).ok()
}

fn parse_method(v: &str) -> Option<Method> {
    Method::from_bytes(v.to_ascii_uppercase().as_bytes()).ok()
}

fn parse_header(v: &str) -> Option<HeaderName> {
    HeaderName::from_bytes(v.to_ascii_lowercase().as_bytes()).ok()
}

/// 根据配置构建 CORS 中间件；未启用或配置无效时返回 None
pub fn build_cors_layer(cors: &CorsConfig) -> Option<CorsLayer> {
    if !cors.enabled {
        return None;
    }

    let origins = parse_list("allowed_origins", &cors.allowed_origins, parse_origin);
    if origins == Allow::List(Vec::new()) {
        tracing::warn!("CORS 已启用但 allowed_origins 为空，已跳过启用");
        return None;
    }
    let methods = parse_list("allowed_methods", &cors.allowed_methods, parse_method);
    let headers = parse_list("allowed_headers", &cors.allowed_headers, parse_header);
    let expose = parse_list("expose_headers", &cors.expose_headers, parse_header);

    // 浏览器不接受携带凭证的通配响应
    if cors.allow_credentials
        && (origins.is_any() || methods.is_any() || headers.is_any() || expose.is_any())
    {
        tracing::error!("CORS 配置无效：allow_credentials=true 不能与 \"*\" 同时使用，已跳过启用");
        return None;
    }

    let mut layer = CorsLayer::new();
    layer = match origins {
        Allow::Any => layer.allow_origin(Any),
        Allow::List(list) => layer.allow_origin(list),
    };
    layer = match methods {
        Allow::Any => layer.allow_methods(Any),
        Allow::List(list) if !list.is_empty() => layer.allow_methods(list),
        Allow::List(_) => layer,
    };
    layer = match headers {
        Allow::Any => layer.allow_headers(Any),
        Allow::List(list) if !list.is_empty() => layer.allow_headers(list),
        Allow::List(_) => layer,
    };
    layer = match expose {
        Allow::Any => layer.expose_headers(Any),
        Allow::List(list) if !list.is_empty() => layer.expose_headers(list),
        Allow::List(_) => layer,
    };

    if cors.allow_credentials {
        layer = layer.allow_credentials(true);
    }
    if let Some(secs) = cors.max_age_secs.filter(|s| *s > 0) {
        layer = layer.max_age(Duration::from_secs(secs));
    }

    Some(layer)
}
