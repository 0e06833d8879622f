use std::io::Cursor;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::codecs::webp::WebPDecoder;
use image::{
    AnimationDecoder, Frame, Frames, ImageDecoder, ImageError, ImageFormat, ImageReader, Limits,
    RgbaImage,
};

use crate::config::ConvertConfig;

/// 图片/动图解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("无法识别的图片格式")]
    UnknownFormat,

    #[error("图片解码失败: {0}")]
    Image(ImageError),

    #[error("{0} 不是受支持的动图容器（支持 GIF / 动态 WebP）")]
    NotAnimated(String),

    #[error("动图解码失败: {0}")]
    Animation(ImageError),

    #[error("动图不包含任何帧")]
    NoFrames,

    #[error("图片超出解码上限: {0}")]
    TooLarge(String),
}

/// 解码资源上限：画布边长、解码器单次分配与全部帧合计的像素字节数、帧数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_dimension: u32,
    pub max_bytes: u64,
    pub max_frames: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_dimension: 4096,
            max_bytes: 256 * 1024 * 1024,
            max_frames: 1000,
        }
    }
}

impl From<&ConvertConfig> for DecodeLimits {
    fn from(settings: &ConvertConfig) -> Self {
        Self {
            max_dimension: settings.max_image_dimension,
            max_bytes: settings.max_decoded_bytes,
            max_frames: settings.max_frames,
        }
    }
}

impl DecodeLimits {
    fn image_limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        limits.max_alloc = Some(self.max_bytes);
        limits
    }
}

/// 动图中的一帧（已合成到完整画布）
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pixels: RgbaImage,
    /// 该帧在下一帧出现前的展示时长
    pub delay: Duration,
}

fn image_error(err: ImageError) -> DecodeError {
    match err {
        ImageError::Limits(e) => DecodeError::TooLarge(e.to_string()),
        other => DecodeError::Image(other),
    }
}

fn animation_error(err: ImageError) -> DecodeError {
    match err {
        ImageError::Limits(e) => DecodeError::TooLarge(e.to_string()),
        other => DecodeError::Animation(other),
    }
}

/// 解码单张静态图（按内容嗅探格式）
pub fn decode_image(bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, DecodeError> {
    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnknownFormat)?;
    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(limits.image_limits());
    let img = reader.decode().map_err(image_error)?;
    Ok(img.to_rgba8())
}

/// 一次性解码整个动图容器。
///
/// 画布尺寸在读到头部后立即校验，超限的容器不会进入逐帧合成。
pub fn decode_animation(
    bytes: &[u8],
    limits: &DecodeLimits,
) -> Result<Vec<DecodedFrame>, DecodeError> {
    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnknownFormat)?;

    let frames = match format {
        ImageFormat::Gif => {
            let mut decoder = GifDecoder::new(Cursor::new(bytes)).map_err(animation_error)?;
            decoder.set_limits(limits.image_limits()).map_err(animation_error)?;
            collect_bounded(decoder.into_frames(), limits)?
        }
        ImageFormat::WebP => {
            let mut decoder = WebPDecoder::new(Cursor::new(bytes)).map_err(animation_error)?;
            if !decoder.has_animation() {
                return Err(DecodeError::NotAnimated("静态 WebP".to_string()));
            }
            decoder.set_limits(limits.image_limits()).map_err(animation_error)?;
            collect_bounded(decoder.into_frames(), limits)?
        }
        other => return Err(DecodeError::NotAnimated(format!("{other:?}"))),
    };

    if frames.is_empty() {
        return Err(DecodeError::NoFrames);
    }
    Ok(frames.into_iter().map(into_decoded).collect())
}

/// 逐帧收集，帧数或累计像素字节超限时立即停止
fn collect_bounded(frames: Frames<'_>, limits: &DecodeLimits) -> Result<Vec<Frame>, DecodeError> {
    let mut out = Vec::new();
    let mut total_bytes: u64 = 0;
    for frame in frames {
        let frame = frame.map_err(animation_error)?;
        total_bytes += frame.buffer().as_raw().len() as u64;
        if out.len() >= limits.max_frames {
            return Err(DecodeError::TooLarge(format!("帧数超过 {}", limits.max_frames)));
        }
        if total_bytes > limits.max_bytes {
            let detail = format!("全部帧像素超过 {} 字节", limits.max_bytes);
            return Err(DecodeError::TooLarge(detail));
        }
        out.push(frame);
    }
    Ok(out)
}

fn into_decoded(frame: Frame) -> DecodedFrame {
    let (numer, denom) = frame.delay().numer_denom_ms();
    let delay = Duration::from_micros(numer as u64 * 1000 / denom.max(1) as u64);
    DecodedFrame {
        pixels: frame.into_buffer(),
        delay,
    }
}
