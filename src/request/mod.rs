//! # 类型化请求
//!
//! ## 设计思路
//!
//! 一个 `Request<D>` 描述“向哪里发什么、如何解码、以什么优先级执行”。
//! 解码方式由类型参数 `D: DecodeStrategy` 决定，结果类型在编译期即确定，
//! 调用方拿到的永远是已经解码好的值。
//!
//! ## 实现思路
//!
//! - 参数保存在 `BTreeMap` 中：键唯一，遍历顺序稳定，`cache_key` 因此可复现。
//! - GET / HEAD / DELETE 把参数拼接到 query；POST / PUT / PATCH 默认以
//!   `application/x-www-form-urlencoded` 表单提交，也可切换为 JSON 对象。
//! - 每个内置解码策略都有对应的构造函数，自定义策略使用 `Request::new`。

pub mod decode;
pub mod xml;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{RequestError, classify_transport};
use crate::retry::RetryPolicy;
use crate::transport::{TransportError, TransportRequest};

pub use decode::{
    DecodeStrategy, Envelope, Enveloped, JsonArray, JsonObject, JsonValue, Text, Typed, TypedList, Xml,
};
pub use xml::{XmlCursor, XmlEvent};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// HTTP 方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
        }
    }

    /// 参数是否随请求体发送（否则拼接到 query）。
    pub fn sends_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

/// 调度优先级，数值越大越先执行。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// 请求体参数编码方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    #[default]
    Form,
    Json,
}

/// 类型化请求。
pub struct Request<D: DecodeStrategy> {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) params: BTreeMap<String, String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) priority: Priority,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) tag: Option<String>,
    pub(crate) should_cache: bool,
    pub(crate) body_format: BodyFormat,
    pub(crate) decoder: D,
}

impl<D: DecodeStrategy> Request<D> {
    /// 使用自定义解码策略创建请求。
    ///
    /// GET 请求默认允许使用响应缓存，其余方法默认不缓存。
    pub fn new(method: Method, url: impl Into<String>, decoder: D) -> Self {
        Self {
            method,
            url: url.into(),
            params: BTreeMap::new(),
            headers: Vec::new(),
            priority: Priority::Normal,
            retry_policy: RetryPolicy::default(),
            tag: None,
            should_cache: method == Method::Get,
            body_format: BodyFormat::Form,
            decoder,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// 设置分组标签，供 `Dispatcher::cancel_all` 批量取消。
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    pub fn body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    pub fn get_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn get_params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// 响应缓存键：`"{METHOD} {url}?{按键排序的参数}"`。
    ///
    /// # 示例
    /// ```rust
    /// use netqueue::request::{Method, Request};
    ///
    /// let request = Request::text(Method::Get, "http://example.com/q")
    ///     .param("b", "2")
    ///     .param("a", "1");
    /// assert_eq!(request.cache_key(), "GET http://example.com/q?a=1&b=2");
    /// ```
    pub fn cache_key(&self) -> String {
        if self.params.is_empty() {
            return format!("{} {}", self.method.as_str(), self.url);
        }
        format!("{} {}?{}", self.method.as_str(), self.url, encode_form(&self.params))
    }

    /// 按方法与编码方式生成交给传输层的请求。
    pub(crate) fn to_transport_request(&self) -> Result<TransportRequest, RequestError> {
        let mut headers = self.headers.clone();

        if !self.method.sends_body() {
            let url = self.url_with_query()?;
            return Ok(TransportRequest {
                method: self.method,
                url,
                headers,
                body: None,
            });
        }

        let (content_type, body) = match self.body_format {
            BodyFormat::Form => (FORM_CONTENT_TYPE, Bytes::from(encode_form(&self.params))),
            BodyFormat::Json => {
                let body = serde_json::to_vec(&self.params).map_err(|e| {
                    classify_transport(&TransportError::InvalidRequest(format!("请求体序列化失败：{}", e)))
                })?;
                (JSON_CONTENT_TYPE, Bytes::from(body))
            }
        };

        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
            headers.push(("Content-Type".to_string(), content_type.to_string()));
        }

        Ok(TransportRequest {
            method: self.method,
            url: self.url.clone(),
            headers,
            body: Some(body),
        })
    }

    fn url_with_query(&self) -> Result<String, RequestError> {
        if self.params.is_empty() {
            return Ok(self.url.clone());
        }

        let mut url = url::Url::parse(&self.url).map_err(|e| {
            classify_transport(&TransportError::InvalidRequest(format!("URL 格式错误：{}", e)))
        })?;
        url.query_pairs_mut().extend_pairs(self.params.iter());
        Ok(url.into())
    }
}

fn encode_form(params: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

impl Request<Text> {
    /// 响应解码为字符串。
    pub fn text(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, Text)
    }
}

impl Request<JsonValue> {
    pub fn json_value(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, JsonValue)
    }
}

impl Request<JsonObject> {
    /// 响应必须是 JSON 对象；参数默认以 JSON 对象作为请求体。
    pub fn json_object(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, JsonObject).body_format(BodyFormat::Json)
    }
}

impl Request<JsonArray> {
    pub fn json_array(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, JsonArray)
    }
}

impl<T: DeserializeOwned + Send + 'static> Request<Typed<T>> {
    /// 响应按 `T` 的 `Deserialize` 实现映射为单个对象。
    ///
    /// `T` 需要标注 `#[serde(default)]`：缺失字段保持零值，未知字段忽略。
    /// 不加该标注时，任一字段缺失都会使整个响应解码失败（`DecodeFailure`）。
    ///
    /// # 示例
    /// ```rust
    /// use netqueue::request::{DecodeStrategy, Typed};
    /// use serde::Deserialize;
    ///
    /// #[derive(Debug, Default, Deserialize)]
    /// #[serde(default)]
    /// struct Event {
    ///     e_id: String,
    ///     title: String,
    /// }
    ///
    /// #[derive(Debug, Deserialize)]
    /// struct StrictEvent {
    ///     e_id: String,
    ///     title: String,
    /// }
    ///
    /// let event = Typed::<Event>::new().decode(br#"{"e_id":"1","extra":true}"#)?;
    /// assert_eq!(event.e_id, "1");
    /// assert_eq!(event.title, "");
    ///
    /// assert!(Typed::<StrictEvent>::new().decode(br#"{"e_id":"1"}"#).is_err());
    /// # Ok::<(), netqueue::RequestError>(())
    /// ```
    pub fn typed(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, Typed::new())
    }
}

impl<T: DeserializeOwned + Send + 'static> Request<TypedList<T>> {
    /// 响应为 JSON 数组，逐项按 `T` 映射；映射失败的单项被跳过并记录警告。
    ///
    /// 与 [`Request::typed`] 相同，`T` 应标注 `#[serde(default)]`，
    /// 否则缺少字段的条目会被整项丢弃。
    pub fn typed_list(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, TypedList::new())
    }
}

impl Request<Envelope> {
    /// 响应解码为 `ResultEnvelope`，错误信封同样作为成功结果交付。
    pub fn envelope(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, Envelope)
    }
}

impl<D: DecodeStrategy> Request<Enveloped<D>> {
    /// 严格信封：非 0 业务码作为失败交付，成功时由 `inner` 解码 `result`。
    pub fn enveloped(method: Method, url: impl Into<String>, inner: D) -> Self {
        Self::new(method, url, Enveloped::new(inner))
    }
}

impl Request<Xml> {
    pub fn xml(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, Xml)
    }
}
