//! # 传输层
//!
//! ## 设计思路
//!
//! 调度器只依赖抽象的 `Transport`：给定方法、地址、头部与请求体，
//! 返回 `(状态码, 头部, 字节)` 或传输错误。具体的套接字/TLS 实现可替换，
//! 测试中用计数桩即可验证调度行为。
//!
//! ## 实现思路
//!
//! - `HttpTransport` 基于 `reqwest`，复用同一个客户端（连接池）。
//! - 单次尝试的总超时由调用方按重试策略传入；分块读取另有独立超时。
//! - 流式读取响应体并在超过体积上限时立即中止，避免一次性读入导致内存峰值。
//! - 日志中的 URL 统一脱敏（去掉 query 与 fragment）。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::config::DispatcherConfig;
use crate::request::Method;

const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;

/// 交给传输层执行的一次 HTTP 调用。
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// 传输层返回的原始响应。头部名统一为小写。
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// 传输层错误，由 `error::classify_transport` 映射为 `RequestError`。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("连接超时")]
    ConnectTimeout,

    #[error("响应超时")]
    ResponseTimeout,

    #[error("无法连接：{0}")]
    Connect(String),

    #[error("I/O 错误：{message}")]
    Io { message: String, transient: bool },

    #[error("请求无效：{0}")]
    InvalidRequest(String),

    #[error("响应体超过限制（{limit} 字节）")]
    BodyTooLarge { limit: u64 },
}

/// 执行 HTTP 调用的抽象。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 执行一次调用；`timeout` 是本次尝试的总超时。
    async fn execute(&self, request: TransportRequest, timeout: Duration) -> Result<TransportResponse, TransportError>;
}

/// 基于 `reqwest` 的默认传输实现。
pub struct HttpTransport {
    client: reqwest::Client,
    max_body_bytes: u64,
    chunk_timeout: Duration,
}

impl HttpTransport {
    /// 根据调度器配置构建复用型 HTTP 客户端。
    pub fn new(config: &DispatcherConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("无法创建 HTTP 客户端：{}", e)))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
            chunk_timeout: config.stream_chunk_timeout(),
        })
    }

    fn to_reqwest_method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Patch => reqwest::Method::PATCH,
        }
    }

    /// 统一映射 reqwest 错误到传输错误。
    fn map_reqwest_error(error: reqwest::Error, url: &str) -> TransportError {
        let message = sanitize_error_message_with_redacted_url(&error.to_string(), url);

        if error.is_timeout() {
            if error.is_connect() {
                TransportError::ConnectTimeout
            } else {
                TransportError::ResponseTimeout
            }
        } else if error.is_connect() {
            TransportError::Connect(message)
        } else if error.is_builder() {
            TransportError::InvalidRequest(message)
        } else {
            let transient = Self::is_transient_error_message(&message);
            TransportError::Io { message, transient }
        }
    }

    fn is_transient_error_message(message: &str) -> bool {
        let msg = message.to_lowercase();
        msg.contains("unexpected eof")
            || msg.contains("connection reset")
            || msg.contains("connection closed before message completed")
            || msg.contains("peer closed connection")
            || msg.contains("tls handshake")
            || msg.contains("broken pipe")
    }

    async fn read_body(&self, mut response: reqwest::Response, url: &str) -> Result<Bytes, TransportError> {
        let declared_len = response.content_length();
        if let Some(len) = declared_len {
            if len > self.max_body_bytes {
                return Err(TransportError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
        }

        let initial_capacity = declared_len
            .map(|len| len.min(self.max_body_bytes).min(usize::MAX as u64) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = BytesMut::with_capacity(initial_capacity);

        loop {
            let next_chunk = tokio::time::timeout(self.chunk_timeout, response.chunk())
                .await
                .map_err(|_| TransportError::ResponseTimeout)?;

            let Some(chunk) = next_chunk.map_err(|e| Self::map_reqwest_error(e, url))? else {
                break;
            };

            if (buffer.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(TransportError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            buffer.extend_from_slice(&chunk);
        }

        Ok(buffer.freeze())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest, timeout: Duration) -> Result<TransportResponse, TransportError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidRequest(format!("URL 格式错误：{}", e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TransportError::InvalidRequest("仅支持 HTTP/HTTPS".to_string()));
        }

        log::debug!(
            "📡 发送 HTTP 请求 - {} {}",
            request.method.as_str(),
            redact_url_for_log(url.as_str())
        );

        let mut builder = self
            .client
            .request(Self::to_reqwest_method(request.method), url.clone())
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_reqwest_error(e, url.as_str()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        let body = self.read_body(response, url.as_str()).await?;
        log::debug!("✅ 响应完成 - status={} {} bytes", status, body.len());

        Ok(TransportResponse { status, headers, body })
    }
}

/// 日志用 URL 脱敏：只保留 scheme、host、port 与 path。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = parsed.path();

    format!("{}://{}{}{}", parsed.scheme(), host, port, path)
}

fn sanitize_error_message_with_redacted_url(error_msg: &str, url: &str) -> String {
    let redacted = redact_url_for_log(url);
    error_msg.replace(url, &redacted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(response: Vec<u8>) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
        let port = listener.local_addr().expect("read local addr failed").port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept failed");
            let mut req_buf = [0u8; 4096];
            let read = stream.read(&mut req_buf).unwrap_or(0);

            stream.write_all(&response).expect("write response failed");
            stream.flush().expect("flush failed");
            String::from_utf8_lossy(&req_buf[..read]).to_string()
        });

        (port, server)
    }

    fn http_response(status_line: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
            status_line,
            extra_headers,
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    #[test]
    fn redact_url_for_log_removes_query_and_fragment() {
        let redacted = redact_url_for_log("https://example.com:8443/path/q.php?key=abc123#hash");

        assert_eq!(redacted, "https://example.com:8443/path/q.php");
        assert_eq!(redact_url_for_log("not a url"), "<invalid-url>");
    }

    #[test]
    fn transient_message_detection() {
        assert!(HttpTransport::is_transient_error_message("Connection reset by peer"));
        assert!(!HttpTransport::is_transient_error_message("invalid certificate"));
    }

    #[tokio::test]
    async fn executes_request_and_collects_headers() {
        let (port, server) = serve_once(http_response(
            "200 OK",
            "Content-Type: application/json\r\nETag: \"v1\"\r\n",
            br#"{"error_code":0}"#,
        ));

        let transport = HttpTransport::new(&DispatcherConfig::default()).expect("transport init failed");
        let response = transport
            .execute(
                TransportRequest {
                    method: Method::Post,
                    url: format!("http://127.0.0.1:{}/query", port),
                    headers: vec![("cookie".into(), "sid=1".into())],
                    body: Some(Bytes::from_static(b"key=value")),
                },
                Duration::from_secs(5),
            )
            .await
            .expect("request should succeed");

        let raw_request = server.join().expect("server thread failed");

        assert_eq!(response.status, 200);
        assert_eq!(response.header("ETag"), Some("\"v1\""));
        assert_eq!(&response.body[..], br#"{"error_code":0}"#);
        assert!(raw_request.starts_with("POST /query"));
        assert!(raw_request.to_lowercase().contains("cookie: sid=1"));
    }

    #[tokio::test]
    async fn rejects_body_over_limit() {
        let (port, server) = serve_once(http_response("200 OK", "", &[b'x'; 64]));

        let config = DispatcherConfig {
            max_body_bytes: 16,
            ..DispatcherConfig::default()
        };
        let transport = HttpTransport::new(&config).expect("transport init failed");
        let result = transport
            .execute(
                TransportRequest {
                    method: Method::Get,
                    url: format!("http://127.0.0.1:{}/big", port),
                    headers: Vec::new(),
                    body: None,
                },
                Duration::from_secs(5),
            )
            .await;

        server.join().expect("server thread failed");
        assert_eq!(result, Err(TransportError::BodyTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let transport = HttpTransport::new(&DispatcherConfig::default()).expect("transport init failed");
        let result = transport
            .execute(
                TransportRequest {
                    method: Method::Get,
                    url: "ftp://example.com/file".into(),
                    headers: Vec::new(),
                    body: None,
                },
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }
}
