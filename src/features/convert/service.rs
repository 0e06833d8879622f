use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use axum::body::Bytes;
use image::RgbaImage;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ConvertConfig;
use crate::error::AppError;
use crate::features::art::{RenderOptions, render};
use crate::worker::WorkerPool;
use crate::worker::pool::panic_message;

use super::cache::{self, ResultCache};
use super::decode::{self, DecodeLimits};

/// 单图转换的结局（三路竞争中只会观察到其一）
#[derive(Debug)]
pub enum SingleOutcome {
    /// 命中缓存，未提交任何任务
    Cached(Bytes),
    /// 本次请求转换得到
    Converted(Bytes),
    /// 等待超时；任务若稍后完成，其缓存写入照常生效
    Busy,
    /// 取消令牌先于结果触发；调用方已无人等待应答
    Abandoned,
}

/// 转换服务：持有线程池、结果缓存与转换参数，由 `AppState` 共享。
#[derive(Debug, Clone)]
pub struct ConversionService {
    pub(super) pool: Arc<WorkerPool>,
    pub(super) cache: ResultCache,
    pub(super) settings: ConvertConfig,
    /// 工作线程借此把缓存写入投递回异步运行时
    pub(super) runtime: Handle,
}

impl ConversionService {
    /// 必须在 tokio 运行时内构造。
    pub fn new(pool: Arc<WorkerPool>, cache: ResultCache, settings: ConvertConfig) -> Self {
        Self {
            pool,
            cache,
            settings,
            runtime: Handle::current(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn settings(&self) -> &ConvertConfig {
        &self.settings
    }

    /// 单图路径：查缓存 → 解码 → 提交 → 在结果 / 取消 / 超时之间竞争。
    ///
    /// 缓存命中时不解码也不提交任务。超时与结果同时就绪时谁胜出不作保证，
    /// 但两种结局都只会应答一次。
    pub async fn convert_single(
        &self,
        upload: Bytes,
        opts: RenderOptions,
        cancel: &CancellationToken,
    ) -> Result<SingleOutcome, AppError> {
        let key = cache::image_key(&upload, &opts);
        if let Some(text) = self.cache.get(&key).await {
            debug!(key = %key, "单图命中缓存");
            return Ok(SingleOutcome::Cached(text));
        }

        let limits = DecodeLimits::from(&self.settings);
        let pixels = tokio::task::spawn_blocking(move || decode::decode_image(&upload, &limits))
            .await??;

        let (tx, rx) = oneshot::channel();
        let job = self.render_job(pixels, opts, key, cancel.clone(), tx);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("请求已取消，放弃提交转换任务");
                return Ok(SingleOutcome::Abandoned);
            }
            submitted = self.pool.submit(job) => submitted?,
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("请求已取消，放弃等待转换结果");
                SingleOutcome::Abandoned
            }
            delivered = rx => match delivered {
                Ok(Ok(text)) => SingleOutcome::Converted(text),
                Ok(Err(panic)) => {
                    return Err(AppError::Internal(format!("转换任务失败: {panic}")));
                }
                Err(_) => return Err(AppError::Internal("转换任务未返回结果".to_string())),
            },
            _ = tokio::time::sleep(self.settings.timeout()) => SingleOutcome::Busy,
        };
        Ok(outcome)
    }

    /// 构造单图转换任务：任务自己捕获 panic 并把结果投递到 `tx`，成功时顺带写缓存。
    fn render_job(
        &self,
        pixels: RgbaImage,
        opts: RenderOptions,
        key: String,
        cancel: CancellationToken,
        tx: oneshot::Sender<Result<Bytes, String>>,
    ) -> impl FnOnce() + Send + 'static {
        let cache = self.cache.clone();
        let runtime = self.runtime.clone();
        move || {
            if cancel.is_cancelled() {
                debug!("请求已取消，跳过尚未开始的转换任务");
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(|| render(&pixels, &opts)))
                .map(Bytes::from)
                .map_err(|payload| panic_message(payload.as_ref()));
            match &result {
                Ok(text) => cache.spawn_store(&runtime, key, text.clone()),
                Err(panic) => error!(panic = %panic, "单图转换 panic"),
            }
            // 等待方可能已因超时/取消离开，投递失败无需处理
            let _ = tx.send(result);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::service;
    use super::*;
    use crate::features::art::{GridLimit, RenderMode};
    use crate::features::convert::decode::fixtures::solid_png;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn plain(width: u32) -> RenderOptions {
        RenderOptions {
            width,
            height: 0,
            mode: RenderMode::Plain,
            limit: GridLimit::default(),
        }
    }

    async fn wait_cached(svc: &ConversionService, key: &str) -> Option<Bytes> {
        for _ in 0..100 {
            if let Some(v) = svc.cache.get(key).await {
                return Some(v);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn converts_then_serves_from_cache() {
        let svc = service(2, 4, 5);
        let upload = Bytes::from(solid_png(2, 2, [255, 255, 255, 255]));
        let cancel = CancellationToken::new();

        let first = svc
            .convert_single(upload.clone(), plain(2), &cancel)
            .await
            .unwrap();
        assert!(matches!(first, SingleOutcome::Converted(ref t) if &t[..] == b"@@\n"));

        let key = cache::image_key(&upload, &plain(2));
        assert!(wait_cached(&svc, &key).await.is_some());

        let second = svc.convert_single(upload, plain(2), &cancel).await.unwrap();
        assert!(matches!(second, SingleOutcome::Cached(ref t) if &t[..] == b"@@\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cache_hit_does_not_decode_or_submit() {
        let svc = service(1, 1, 5);
        let upload = Bytes::from_static(b"not an image at all");
        let key = cache::image_key(&upload, &plain(4));
        svc.cache
            .set(key, Bytes::from_static(b"cached\n"), Duration::from_secs(60))
            .await;

        // 线程池已关闭：若发生提交会得到 503
        svc.pool.shutdown();
        let outcome = svc
            .convert_single(upload, plain(4), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, SingleOutcome::Cached(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_upload_is_unsupported_media() {
        let svc = service(1, 1, 5);
        let err = svc
            .convert_single(
                Bytes::from_static(b"garbage"),
                plain(4),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedImage(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_pool_times_out_as_busy_and_late_result_still_caches() {
        let svc = service(1, 4, 1);
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        svc.pool
            .submit(move || {
                let _ = gate_rx.recv();
            })
            .await
            .unwrap();

        let upload = Bytes::from(solid_png(2, 2, [0, 0, 0, 255]));
        let outcome = svc
            .convert_single(upload.clone(), plain(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, SingleOutcome::Busy));

        gate_tx.send(()).unwrap();
        let key = cache::image_key(&upload, &plain(2));
        assert_eq!(
            wait_cached(&svc, &key).await.as_deref(),
            Some(&b"..\n"[..])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_abandons_wait_and_skips_unstarted_job() {
        let svc = service(1, 4, 5);
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        svc.pool
            .submit(move || {
                let _ = gate_rx.recv();
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let upload = Bytes::from(solid_png(2, 2, [255, 255, 255, 255]));
        let outcome = svc
            .convert_single(upload.clone(), plain(2), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, SingleOutcome::Abandoned));

        // 放行阻塞任务后，被取消的任务不会执行，也就不会写缓存
        gate_tx.send(()).unwrap();
        svc.pool.clone().shutdown_gracefully(Duration::from_secs(2)).await;
        let key = cache::image_key(&upload, &plain(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(svc.cache.get(&key).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_request_future_cancels_through_the_guard() {
        let svc = service(1, 4, 5);
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        svc.pool
            .submit(move || {
                let _ = gate_rx.recv();
            })
            .await
            .unwrap();

        let upload = Bytes::from(solid_png(2, 2, [255, 255, 255, 255]));
        let cancel = CancellationToken::new();
        let request = tokio::spawn({
            let svc = svc.clone();
            let cancel = cancel.clone();
            let upload = upload.clone();
            async move {
                let guard = cancel.clone().drop_guard();
                let outcome = svc.convert_single(upload, plain(2), &cancel).await;
                guard.disarm();
                outcome
            }
        });

        // 模拟客户端断开：处理函数的 future 在等待结果时被丢弃
        tokio::time::sleep(Duration::from_millis(50)).await;
        request.abort();
        let _ = request.await;
        assert!(cancel.is_cancelled());

        gate_tx.send(()).unwrap();
        svc.pool.clone().shutdown_gracefully(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let key = cache::image_key(&upload, &plain(2));
        assert!(svc.cache.get(&key).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_pool_reports_unavailable() {
        let svc = service(1, 1, 5);
        svc.pool.shutdown();
        let err = svc
            .convert_single(
                Bytes::from(solid_png(1, 1, [9, 9, 9, 255])),
                plain(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
    }
}
