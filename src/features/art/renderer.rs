use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// 亮度由暗到亮的字符梯度
pub const CHARSET: &[u8] = b".:-=+*>#%@";

/// 字符高宽比修正：终端字符比宽度高，推导行数时按该系数压缩
pub const CHAR_ASPECT: f64 = 0.55;

/// width/height 都未指定时的默认列数
pub const DEFAULT_WIDTH: u32 = 100;

/// 输出网格默认的行列上限
pub const DEFAULT_GRID_LIMIT: u32 = 1000;

/// 输出模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// 纯文本字符
    #[default]
    Plain,
    /// 每个字符包裹 24 位真彩色转义序列
    Ansi,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Plain => "plain",
            RenderMode::Ansi => "ansi",
        }
    }
}

/// 输出网格的行列上限，推导出的边同样受其约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLimit {
    pub cols: u32,
    pub rows: u32,
}

impl Default for GridLimit {
    fn default() -> Self {
        Self {
            cols: DEFAULT_GRID_LIMIT,
            rows: DEFAULT_GRID_LIMIT,
        }
    }
}

impl GridLimit {
    /// 超限时按比例整体缩小，使两边都落在上限内
    fn fit(&self, cols: u32, rows: u32) -> (u32, u32) {
        let (mut w, mut h) = (cols as u64, rows as u64);
        let (max_w, max_h) = (self.cols.max(1) as u64, self.rows.max(1) as u64);
        if w > max_w {
            h = h * max_w / w;
            w = max_w;
        }
        if h > max_h {
            w = w * max_h / h;
            h = max_h;
        }
        (w as u32, h as u32)
    }
}

/// 请求的输出形状（0 表示按原图比例推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub mode: RenderMode,
    pub limit: GridLimit,
}

/// 计算输出的列数与行数。
///
/// - width、height 都给定：直接使用
/// - 只给 height：列数按原图比例推导并除以 [`CHAR_ASPECT`]
/// - 只给 width（或都未给，取 [`DEFAULT_WIDTH`]）：行数按原图比例推导并乘以 [`CHAR_ASPECT`]
///
/// 结果超出 `limit` 时保持比例缩小到上限内；为 0 而原图对应边长为正时，强制为 1。
pub fn target_dimensions(
    src_w: u32,
    src_h: u32,
    width: u32,
    height: u32,
    limit: GridLimit,
) -> (u32, u32) {
    if src_w == 0 || src_h == 0 {
        return (0, 0);
    }
    let ratio = src_h as f64 / src_w as f64;

    let (w, h) = match (width, height) {
        (w, h) if w > 0 && h > 0 => (w, h),
        (0, h) if h > 0 => (((h as f64 / ratio) / CHAR_ASPECT) as u32, h),
        (w, _) => {
            let w = if w == 0 { DEFAULT_WIDTH } else { w };
            (w, (w as f64 * ratio * CHAR_ASPECT) as u32)
        }
    };

    let (w, h) = limit.fit(w, h);
    (w.max(1), h.max(1))
}

/// 把像素网格转换为字符画；每行以换行结尾，最近邻采样。
pub fn render(img: &RgbaImage, opts: &RenderOptions) -> String {
    let (src_w, src_h) = img.dimensions();
    let (cols, rows) = target_dimensions(src_w, src_h, opts.width, opts.height, opts.limit);

    let per_cell = match opts.mode {
        RenderMode::Plain => 1,
        RenderMode::Ansi => 25,
    };
    let mut out = String::with_capacity((cols as usize * per_cell + 1) * rows as usize);

    for y in 0..rows {
        let src_y = (y as u64 * src_h as u64 / rows as u64) as u32;
        for x in 0..cols {
            let src_x = (x as u64 * src_w as u64 / cols as u64) as u32;
            let (ch, r, g, b) = pixel_to_char(*img.get_pixel(src_x, src_y));
            match opts.mode {
                RenderMode::Plain => out.push(ch as char),
                RenderMode::Ansi => push_ansi(&mut out, ch, r, g, b),
            }
        }
        out.push('\n');
    }
    out
}

/// 像素 → (字符, 预乘 alpha 后的 R, G, B)
fn pixel_to_char(px: Rgba<u8>) -> (u8, u8, u8, u8) {
    let [r, g, b, a] = px.0;
    let premul = |c: u8| ((c as u32 * a as u32) / 255) as u8;
    let (r, g, b) = (premul(r), premul(g), premul(b));

    let lum = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471) >> 16;
    let last = CHARSET.len() - 1;
    let index = (lum as usize * last / 255).min(last);
    (CHARSET[index], r, g, b)
}

fn push_ansi(out: &mut String, ch: u8, r: u8, g: u8, b: u8) {
    // 写入 String 不会失败
    let _ = write!(out, "\x1b[38;2;{r};{g};{b}m{}\x1b[0m", ch as char);
}
