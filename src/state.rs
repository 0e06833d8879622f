use std::sync::Arc;

use crate::features::convert::ConversionService;

/// 聚合的应用共享状态
#[derive(Debug, Clone)]
pub struct AppState {
    /// 转换服务（线程池 + 结果缓存 + 转换参数）
    pub converter: Arc<ConversionService>,
}

impl AppState {
    pub fn new(converter: ConversionService) -> Self {
        Self {
            converter: Arc::new(converter),
        }
    }
}
