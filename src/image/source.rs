//! # 图片来源与中间模型
//!
//! ## 设计思路
//!
//! 将“输入来源”和“解码结果”解耦：
//! - 网络地址交给调度器下载
//! - `data:image/...;base64,` 地址在本地直接解码，不经过网络
//! - `DecodedImage` 是缓存与交付的统一形态（RGBA 像素）

use base64::{Engine as _, engine::general_purpose};

use crate::error::RequestError;

const DATA_URL_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = ";base64,";

/// 解码后的 RGBA 图像。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// 由 RGBA 像素构造；长度必须等于 `width * height * 4`。
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, RequestError> {
        let expected = rgba_len(width, height)
            .ok_or_else(|| RequestError::DecodeFailure("图片尺寸导致内存溢出风险".to_string()))?;

        if pixels.len() as u64 != expected {
            return Err(RequestError::DecodeFailure(format!(
                "像素数据长度异常：{}（期望：{}）",
                pixels.len(),
                expected
            )));
        }

        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// 缓存记账用的字节开销：`width * height * 4`。
    pub fn byte_cost(&self) -> u64 {
        rgba_len(self.width, self.height).unwrap_or(u64::MAX)
    }
}

fn rgba_len(width: u32, height: u32) -> Option<u64> {
    (width as u64).checked_mul(height as u64)?.checked_mul(4)
}

pub(crate) fn is_data_url(url: &str) -> bool {
    url.trim_start().starts_with(DATA_URL_PREFIX)
}

fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, RequestError> {
    let len = base64_data.trim().len() as u64;
    let groups = len
        .checked_add(3)
        .ok_or_else(|| RequestError::DecodeFailure("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| RequestError::DecodeFailure("Base64 解码体积估算溢出".to_string()))
}

/// 解析 `data:image/...;base64,` 地址，先按编码长度估算解码体积再解码。
pub(crate) fn parse_data_url(url: &str, max_file_size: u64) -> Result<Vec<u8>, RequestError> {
    let normalized = url.trim();
    if !normalized.starts_with(DATA_URL_PREFIX) {
        return Err(RequestError::DecodeFailure("不是图片 Data URL".to_string()));
    }

    let base64_start = normalized
        .find(BASE64_MARKER)
        .ok_or_else(|| RequestError::DecodeFailure("缺少 base64 标记".to_string()))?;
    let base64_data = &normalized[base64_start + BASE64_MARKER.len()..];

    let estimated_len = estimate_base64_decoded_upper_bound_len(base64_data)?;
    if estimated_len > max_file_size {
        return Err(RequestError::DecodeFailure(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    general_purpose::STANDARD
        .decode(base64_data)
        .map_err(|e| RequestError::DecodeFailure(format!("Base64 解码失败：{}", e)))
}

/// 通过文件签名（magic bytes）拒绝明确不是图片的内容。
///
/// 无法识别签名的字节交给解码器继续判断。
pub(crate) fn validate_image_signature(bytes: &[u8]) -> Result<(), RequestError> {
    if bytes.is_empty() {
        return Err(RequestError::EmptyResponse);
    }

    if let Some(kind) = infer::get(bytes) {
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(RequestError::DecodeFailure(format!(
                "内容不是图片类型：{}",
                kind.mime_type()
            )));
        }
    }

    Ok(())
}
