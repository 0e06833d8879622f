/// 像素 → 字符映射
pub mod art;

/// 静态图转换与动图推送
pub mod convert;

/// 健康检查
pub mod health;
