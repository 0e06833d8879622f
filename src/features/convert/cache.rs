//! 内容寻址的结果缓存
//!
//! key 由输入内容的 SHA-256 与输出形状（宽、高、模式）拼成；value 为生成的字符画文本。
//! 条目按写入时给定的 TTL 被动过期，读到过期条目即视为未命中。

use std::time::{Duration, Instant};

use axum::body::Bytes;
use moka::Expiry;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;

use crate::config::CacheConfig;
use crate::features::art::RenderOptions;

/// 单图缓存 key：`img:{sha256(上传字节)}:{w}:{h}:{mode}`
pub fn image_key(upload: &[u8], opts: &RenderOptions) -> String {
    shaped_key("img", upload, opts)
}

/// 动图单帧缓存 key：`frame:{sha256(帧像素)}:{w}:{h}:{mode}`
pub fn frame_key(pixels: &[u8], opts: &RenderOptions) -> String {
    shaped_key("frame", pixels, opts)
}

fn shaped_key(kind: &str, content: &[u8], opts: &RenderOptions) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!(
        "{kind}:{digest}:{}:{}:{}",
        opts.width,
        opts.height,
        opts.mode.as_str()
    )
}

#[derive(Debug, Clone)]
struct CachedArt {
    text: Bytes,
    ttl: Duration,
}

/// 每个条目按自身 TTL 过期（同 key 重写时刷新）
struct PerEntryTtl;

impl Expiry<String, CachedArt> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedArt,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedArt,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 结果缓存；关闭时所有读取都是未命中、写入直接丢弃。
#[derive(Clone)]
pub struct ResultCache {
    inner: Option<Cache<String, CachedArt>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }
        let inner = Cache::builder()
            .weigher(|_k, v: &CachedArt| u32::try_from(v.text.len()).unwrap_or(u32::MAX))
            .max_capacity(cfg.max_bytes)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            inner: Some(inner),
            ttl: cfg.ttl(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            ttl: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// 转换任务写回时使用的默认 TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let cache = self.inner.as_ref()?;
        cache.get(key).await.map(|art| art.text)
    }

    pub async fn set(&self, key: String, text: Bytes, ttl: Duration) {
        if let Some(cache) = &self.inner {
            cache.insert(key, CachedArt { text, ttl }).await;
        }
    }

    /// 从工作线程发起的“尽力而为”写入：投递到运行时后立即返回，调用方不观察结果。
    pub fn spawn_store(&self, runtime: &Handle, key: String, text: Bytes) {
        if !self.is_enabled() {
            return;
        }
        let cache = self.clone();
        let ttl = self.ttl;
        // 运行时关闭后投递的任务会被直接取消，写入随之放弃
        runtime.spawn(async move {
            cache.set(key.clone(), text, ttl).await;
            tracing::debug!(key = %key, "转换结果已写入缓存");
        });
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.is_enabled())
            .field("ttl", &self.ttl)
            .finish()
    }
}
