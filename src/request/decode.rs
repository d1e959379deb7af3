//! # 解码策略
//!
//! 每种请求变体对应一个 `DecodeStrategy`：把响应字节转换为目标类型，
//! 失败一律归类为 `RequestError`。解码是确定性的，调度器从不因解码失败而重试。
//!
//! 类型化映射直接使用 `serde` 派生：`Deserialize` 实现就是编译期确定的字段表。
//! 目标类型通常标注 `#[serde(default)]`，未知字段忽略，缺失字段保持零值。

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::xml::XmlCursor;
use crate::envelope::{ResultEnvelope, collect_forgiving, decode_envelope};
use crate::error::RequestError;

/// 响应解码策略。
pub trait DecodeStrategy: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, RequestError>;
}

fn parse_json(body: &[u8]) -> Result<Value, RequestError> {
    serde_json::from_slice(body).map_err(|e| RequestError::DecodeFailure(format!("JSON 解析失败：{}", e)))
}

/// UTF-8 文本。
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl DecodeStrategy for Text {
    type Output = String;

    fn decode(&self, body: &[u8]) -> Result<String, RequestError> {
        String::from_utf8(body.to_vec()).map_err(|e| RequestError::DecodeFailure(format!("响应不是有效的 UTF-8：{}", e)))
    }
}

/// 任意 JSON 文档。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValue;

impl DecodeStrategy for JsonValue {
    type Output = Value;

    fn decode(&self, body: &[u8]) -> Result<Value, RequestError> {
        parse_json(body)
    }
}

/// 顶层必须是 JSON 对象。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObject;

impl DecodeStrategy for JsonObject {
    type Output = Map<String, Value>;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, RequestError> {
        match parse_json(body)? {
            Value::Object(map) => Ok(map),
            _ => Err(RequestError::DecodeFailure("响应不是 JSON 对象".to_string())),
        }
    }
}

/// 顶层必须是 JSON 数组。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArray;

impl DecodeStrategy for JsonArray {
    type Output = Vec<Value>;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, RequestError> {
        match parse_json(body)? {
            Value::Array(items) => Ok(items),
            _ => Err(RequestError::DecodeFailure("响应不是 JSON 数组".to_string())),
        }
    }
}

/// 映射为单个类型化对象。
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Typed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Typed<{}>", std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned + Send + 'static> DecodeStrategy for Typed<T> {
    type Output = T;

    fn decode(&self, body: &[u8]) -> Result<T, RequestError> {
        serde_json::from_slice(body).map_err(|e| RequestError::DecodeFailure(e.to_string()))
    }
}

/// 映射为类型化列表；单项映射失败只跳过该项。
pub struct TypedList<T>(PhantomData<fn() -> T>);

impl<T> TypedList<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedList<{}>", std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned + Send + 'static> DecodeStrategy for TypedList<T> {
    type Output = Vec<T>;

    fn decode(&self, body: &[u8]) -> Result<Vec<T>, RequestError> {
        match parse_json(body)? {
            Value::Array(items) => Ok(collect_forgiving(items)),
            _ => Err(RequestError::DecodeFailure("载荷不是 JSON 数组".to_string())),
        }
    }
}

/// 交付完整信封（包括错误形态），从不失败。
#[derive(Debug, Clone, Copy, Default)]
pub struct Envelope;

impl DecodeStrategy for Envelope {
    type Output = ResultEnvelope;

    fn decode(&self, body: &[u8]) -> Result<ResultEnvelope, RequestError> {
        Ok(decode_envelope(Some(body)))
    }
}

/// 严格信封：只有 `error_code == 0` 时才把 `result` 交给内层策略。
#[derive(Debug, Clone, Default)]
pub struct Enveloped<D> {
    inner: D,
}

impl<D> Enveloped<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D: DecodeStrategy> DecodeStrategy for Enveloped<D> {
    type Output = D::Output;

    fn decode(&self, body: &[u8]) -> Result<D::Output, RequestError> {
        let payload = decode_envelope(Some(body)).into_result()?;
        self.inner.decode(payload.as_bytes())
    }
}

/// XML 拉取式事件流。
#[derive(Debug, Clone, Copy, Default)]
pub struct Xml;

impl DecodeStrategy for Xml {
    type Output = XmlCursor;

    fn decode(&self, body: &[u8]) -> Result<XmlCursor, RequestError> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RequestError::EmptyResponse);
        }
        Ok(XmlCursor::new(body.to_vec()))
    }
}
