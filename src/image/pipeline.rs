//! # 解码与降采样流水线
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → RGBA”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先读取 header 尺寸做检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 文件签名校验，明确不是图片的内容直接拒绝
//! 2. 猜测格式并读取 header 尺寸，按像素/内存上限快速拒绝
//! 3. 完整解码
//! 4. 按目标尺寸等比缩放（只缩小不放大），优先 `fast_image_resize`
//! 5. 转换 RGBA

use std::io::Cursor;
use std::sync::Arc;

use fast_image_resize as fr;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageReader, Rgba};

use super::config::ImageConfig;
use super::source::{DecodedImage, validate_image_signature};
use crate::error::RequestError;
use crate::request::DecodeStrategy;

/// 图片解码策略：字节 → `DecodedImage`，可按目标尺寸降采样。
///
/// 目标宽高均为 0 时保持原尺寸（仍受 `max_output_dimension` 约束）；
/// 只有一边为 0 时按另一边等比推导。
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    target_width: u32,
    target_height: u32,
    config: Arc<ImageConfig>,
}

impl ImageDecoder {
    pub fn new(target_width: u32, target_height: u32, config: Arc<ImageConfig>) -> Self {
        Self {
            target_width,
            target_height,
            config,
        }
    }
}

impl DecodeStrategy for ImageDecoder {
    type Output = DecodedImage;

    fn decode(&self, body: &[u8]) -> Result<DecodedImage, RequestError> {
        validate_image_signature(body)?;

        let (header_width, header_height) = inspect_dimensions_from_memory(body)?;
        validate_limits(&self.config, header_width, header_height)?;

        let decoded =
            image::load_from_memory(body).map_err(|e| RequestError::DecodeFailure(format!("图片解码失败：{}", e)))?;

        let (raw_width, raw_height) = decoded.dimensions();
        validate_limits(&self.config, raw_width, raw_height)?;

        let (width, height) = fit_within(
            raw_width,
            raw_height,
            self.target_width,
            self.target_height,
            self.config.max_output_dimension,
        );

        let output = if (width, height) == (raw_width, raw_height) {
            decoded
        } else {
            log::debug!(
                "🧩 图片降采样：{}x{} -> {}x{}（filter={:?}）",
                raw_width,
                raw_height,
                width,
                height,
                self.config.resize_filter
            );
            resize(decoded, width, height, self.config.resize_filter)
        };

        let (width, height) = output.dimensions();
        DecodedImage::from_rgba(width, height, output.to_rgba8().into_raw())
    }
}

/// 仅通过内存中的图片头信息读取宽高。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), RequestError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| RequestError::DecodeFailure(format!("无法识别图片格式：{}", e)))?;

    reader
        .into_dimensions()
        .map_err(|e| RequestError::DecodeFailure(format!("无法读取图片尺寸：{}", e)))
}

fn validate_limits(config: &ImageConfig, width: u32, height: u32) -> Result<(), RequestError> {
    let pixels = (width as u64) * (height as u64);
    if pixels > config.max_decoded_pixels {
        return Err(RequestError::DecodeFailure(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, config.max_decoded_pixels
        )));
    }

    let estimated = pixels.saturating_mul(4);
    if estimated > config.max_decoded_bytes {
        return Err(RequestError::DecodeFailure(format!(
            "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
            estimated as f64 / 1024.0 / 1024.0,
            config.max_decoded_bytes as f64 / 1024.0 / 1024.0
        )));
    }

    Ok(())
}

/// 计算等比缩放后的输出尺寸，只缩小不放大。
pub(crate) fn fit_within(width: u32, height: u32, target_width: u32, target_height: u32, max_dimension: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let (w, h) = (width as f64, height as f64);
    let mut scale: f64 = 1.0;

    match (target_width, target_height) {
        (0, 0) => {}
        (tw, 0) => scale = scale.min(tw as f64 / w),
        (0, th) => scale = scale.min(th as f64 / h),
        (tw, th) => scale = scale.min((tw as f64 / w).min(th as f64 / h)),
    }

    if max_dimension > 0 {
        scale = scale.min((max_dimension as f64 / w).min(max_dimension as f64 / h));
    }

    if scale >= 1.0 {
        return (width, height);
    }

    let out_width = ((w * scale).round() as u32).max(1);
    let out_height = ((h * scale).round() as u32).max(1);
    (out_width, out_height)
}

fn resize(image: DynamicImage, width: u32, height: u32, filter: FilterType) -> DynamicImage {
    match resize_with_fast_image_resize(&image, width, height, filter) {
        Ok(resized) => resized,
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 降采样失败，回退 image::resize_exact：{}", err);
            image.resize_exact(width, height, filter)
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    filter: FilterType,
) -> Result<DynamicImage, RequestError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| RequestError::DecodeFailure(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(to_fast_filter(filter)));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| RequestError::DecodeFailure(format!("fast_image_resize 执行失败：{}", e)))?;

    let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| RequestError::DecodeFailure("fast_image_resize 输出缓冲长度异常".to_string()))?;

    Ok(DynamicImage::ImageRgba8(rgba))
}

fn to_fast_filter(filter: FilterType) -> fr::FilterType {
    match filter {
        FilterType::Nearest => fr::FilterType::Box,
        FilterType::Triangle => fr::FilterType::Bilinear,
        FilterType::CatmullRom => fr::FilterType::CatmullRom,
        FilterType::Gaussian => fr::FilterType::Mitchell,
        FilterType::Lanczos3 => fr::FilterType::Lanczos3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgba([(x % 255) as u8, (y % 255) as u8, 120, 255]));

        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("encode png failed");
        cursor.into_inner()
    }

    fn decoder(width: u32, height: u32) -> ImageDecoder {
        ImageDecoder::new(width, height, Arc::new(ImageConfig::default()))
    }

    #[test]
    fn fit_preserves_aspect_and_never_upscales() {
        assert_eq!(fit_within(400, 200, 100, 100, 0), (100, 50));
        assert_eq!(fit_within(400, 200, 0, 50, 0), (100, 50));
        assert_eq!(fit_within(400, 200, 200, 0, 0), (200, 100));
        assert_eq!(fit_within(40, 20, 100, 100, 0), (40, 20));
        assert_eq!(fit_within(4000, 1000, 0, 0, 2000), (2000, 500));
    }

    #[test]
    fn decodes_png_at_original_size() {
        let image = decoder(0, 0).decode(&create_png_bytes(8, 6)).expect("decode png");

        assert_eq!((image.width(), image.height()), (8, 6));
        assert_eq!(image.pixels().len(), 8 * 6 * 4);
    }

    #[test]
    fn downsamples_to_target() {
        let image = decoder(16, 16).decode(&create_png_bytes(64, 32)).expect("decode png");

        assert_eq!((image.width(), image.height()), (16, 8));
        assert_eq!(image.byte_cost(), 16 * 8 * 4);
    }

    #[test]
    fn rejects_images_over_pixel_limit() {
        let config = ImageConfig {
            max_decoded_pixels: 100,
            ..ImageConfig::default()
        };
        let result = ImageDecoder::new(0, 0, Arc::new(config)).decode(&create_png_bytes(20, 20));

        assert!(matches!(result, Err(RequestError::DecodeFailure(_))));
    }

    #[test]
    fn rejects_non_image_bytes() {
        assert!(matches!(
            decoder(0, 0).decode(b"definitely not an image"),
            Err(RequestError::DecodeFailure(_))
        ));
        assert_eq!(decoder(0, 0).decode(b""), Err(RequestError::EmptyResponse));
    }
}
