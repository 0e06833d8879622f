use std::sync::Arc;

use rune_engine::config::{AppConfig, LoggingConfig};
use rune_engine::features::convert::{ConversionService, ResultCache};
use rune_engine::{AppState, ShutdownManager, WorkerPool, app};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("rune_engine={lvl},tower_http={lvl}", lvl = logging.level).into()
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.is_json() {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    // 配置决定日志格式，因此先加载配置；失败时用默认日志配置输出错误
    if let Err(e) = AppConfig::init_global() {
        init_tracing(&LoggingConfig::default());
        tracing::error!("Config init failed: {}", e);
        std::process::exit(1);
    }
    let config = AppConfig::global();
    init_tracing(&config.logging);

    // 创建优雅退出管理器并启动信号处理器
    let shutdown_manager = ShutdownManager::new();
    if let Err(e) = shutdown_manager.start_signal_handler().await {
        tracing::error!("信号处理器启动失败: {}", e);
        std::process::exit(1);
    }

    let pool = match WorkerPool::start(
        config.pool.effective_workers(),
        config.pool.queue_capacity,
    ) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!("转换线程池启动失败: {}", e);
            std::process::exit(1);
        }
    };

    let cache = ResultCache::new(&config.cache);
    if !cache.is_enabled() {
        tracing::warn!("结果缓存已关闭，所有请求都将重新转换");
    }
    let converter = ConversionService::new(pool.clone(), cache, config.convert.clone());
    let app = app::build_router(AppState::new(converter), config);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Bind address failed {}: {}", addr, e);
            std::process::exit(1);
        });

    tracing::info!("Server: http://{}", addr);
    tracing::info!("Convert API: http://{}{}/convert", addr, config.api.prefix);
    tracing::info!("Stream API: http://{}{}/stream", addr, config.api.prefix);
    tracing::info!("OpenAPI: http://{}/api-docs/openapi.json", addr);

    let shutdown_signal = {
        let manager = shutdown_manager.clone();
        async move {
            let reason = manager.wait_for_shutdown().await;
            tracing::info!("接收到退出信号: {:?}，开始优雅关闭HTTP服务器...", reason);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        tracing::error!("服务器运行错误: {}", e);
        std::process::exit(1);
    }

    // HTTP 已停止接收请求：排空线程池中剩余的转换任务
    let timeout = config.shutdown.timeout_duration();
    tracing::info!("优雅退出超时时间: {}秒", config.shutdown.timeout_secs);
    if pool.shutdown_gracefully(timeout).await {
        tracing::info!("服务器已优雅关闭");
    } else {
        tracing::warn!("线程池未能在超时内排空，强制退出");
    }
}
