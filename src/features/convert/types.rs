use serde::Deserialize;

use crate::config::ConvertConfig;
use crate::error::AppError;
use crate::features::art::{GridLimit, RenderMode, RenderOptions};

/// `/convert` 与 `/stream` 共用的查询参数
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConvertQuery {
    /// 输出列数（缺省取配置的默认列数；0 表示按 height 推导）
    pub width: Option<u32>,
    /// 输出行数（缺省或 0 表示按原图比例推导）
    pub height: Option<u32>,
    /// plain | ansi
    pub mode: Option<RenderMode>,
}

impl ConvertQuery {
    /// 套用默认值并校验上限；上限同时约束按比例推导出的边
    pub fn resolve(self, settings: &ConvertConfig) -> Result<RenderOptions, AppError> {
        let width = self.width.unwrap_or(settings.default_width);
        let height = self.height.unwrap_or(0);

        if width > settings.max_width {
            return Err(AppError::Validation(format!(
                "width 不能超过 {}",
                settings.max_width
            )));
        }
        if height > settings.max_height {
            return Err(AppError::Validation(format!(
                "height 不能超过 {}",
                settings.max_height
            )));
        }

        Ok(RenderOptions {
            width,
            height,
            mode: self.mode.unwrap_or_default(),
            limit: GridLimit {
                cols: settings.max_width,
                rows: settings.max_height,
            },
        })
    }
}

/// multipart 上传体（仅用于 OpenAPI 描述）
#[derive(Debug, utoipa::ToSchema)]
#[allow(dead_code)]
pub struct ImageUpload {
    /// 图片文件；`/stream` 需要 GIF 或动态 WebP
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
}
