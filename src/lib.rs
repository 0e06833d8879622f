/// 统一错误处理模块
pub mod error;

/// 配置模块
pub mod config;

/// 转换线程池
pub mod worker;

/// 功能聚合模块
pub mod features;

/// 应用状态聚合模块
pub mod state;

/// 路由与中间件装配
pub mod app;

/// CORS 中间件
pub mod cors;

/// request_id 与访问日志中间件
pub mod request_id;

/// OpenAPI 文档
pub mod openapi;

/// 优雅退出管理模块
pub mod shutdown;

// 导出常用类型供外部使用
pub use config::AppConfig;
pub use error::AppError;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::AppState;
pub use worker::WorkerPool;
