//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 请求链路上所有失败都归入封闭的 `RequestError` 枚举，调用方只需要 `match`，
//! 永远不必检查底层传输库抛出的原始错误。
//!
//! 配置校验失败与请求失败语义不同，单独使用 `ConfigError`。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息，`Display` 即面向用户的稳定文案。
//! - `classify_transport` / `classify_status` 是纯函数：同样的输入永远得到同样的分类。
//! - `is_retryable` 决定重试策略是否接管；信封与解码错误是确定性的，从不重试。

use crate::transport::TransportError;

/// 信封层本地错误使用的错误码。
pub const LOCAL_ERROR_CODE: i64 = -1;

/// 请求失败分类（封闭集合）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// 响应体为空。
    #[error("返回结果为空")]
    EmptyResponse,

    /// 响应体无法解析为 `{error_code, reason, result}` 信封。
    #[error("数据格式转换异常：{0}")]
    MalformedEnvelope(String),

    /// 信封格式正确但业务码非 0。
    #[error("{reason}")]
    ApplicationError { code: i64, reason: String },

    /// 在不允许阻塞的执行上下文中发起了同步等待。
    #[error("不能在异步运行时线程中同步等待网络请求")]
    MainThreadViolation,

    #[error("服务器请求超时")]
    ConnectTimeout,

    #[error("服务器响应超时")]
    ResponseTimeout,

    /// 传输层 I/O 失败；`transient` 表示是否值得重试。
    #[error("网络 I/O 异常：{message}")]
    TransportIo { message: String, transient: bool },

    #[error("数据解析失败：{0}")]
    DecodeFailure(String),

    /// 请求已取消。取消不会触发失败回调，只在句柄上可见。
    #[error("请求已取消")]
    Cancelled,
}

impl RequestError {
    /// 稳定的机器可读错误码，便于日志聚合与前端分支。
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyResponse => "E_EMPTY",
            Self::MalformedEnvelope(_) => "E_MALFORMED",
            Self::ApplicationError { .. } => "E_APPLICATION",
            Self::MainThreadViolation => "E_MAIN_THREAD",
            Self::ConnectTimeout => "E_CONNECT_TIMEOUT",
            Self::ResponseTimeout => "E_RESPONSE_TIMEOUT",
            Self::TransportIo { .. } => "E_IO",
            Self::DecodeFailure(_) => "E_DECODE",
            Self::Cancelled => "E_CANCELLED",
        }
    }

    /// 是否属于可重试的瞬时故障。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectTimeout | Self::ResponseTimeout => true,
            Self::TransportIo { transient, .. } => *transient,
            _ => false,
        }
    }

    /// 写入错误信封时使用的 `error_code`。
    pub fn envelope_code(&self) -> i64 {
        match self {
            Self::ApplicationError { code, .. } => *code,
            _ => LOCAL_ERROR_CODE,
        }
    }
}

/// 将传输层错误映射为稳定分类。
pub fn classify_transport(error: &TransportError) -> RequestError {
    match error {
        TransportError::ConnectTimeout => RequestError::ConnectTimeout,
        TransportError::ResponseTimeout => RequestError::ResponseTimeout,
        TransportError::Connect(message) => RequestError::TransportIo {
            message: format!("无法连接：{}", message),
            transient: true,
        },
        TransportError::Io { message, transient } => RequestError::TransportIo {
            message: message.clone(),
            transient: *transient,
        },
        TransportError::InvalidRequest(message) => RequestError::TransportIo {
            message: format!("请求无效：{}", message),
            transient: false,
        },
        TransportError::BodyTooLarge { limit } => RequestError::TransportIo {
            message: format!("响应体超过大小限制（{} 字节）", limit),
            transient: false,
        },
    }
}

/// 将非 2xx 的 HTTP 状态码映射为分类；成功状态返回 `None`。
///
/// 408 / 429 / 5xx 视为瞬时故障，其余 4xx（含鉴权失败）不重试。
pub fn classify_status(status: u16) -> Option<RequestError> {
    if (200..300).contains(&status) {
        return None;
    }

    let transient = status == 408 || status == 429 || (500..=599).contains(&status);
    Some(RequestError::TransportIo {
        message: format!("HTTP {}: {}", status, status_message(status)),
        transient,
    })
}

/// 常见 HTTP 状态码本地化文案。
fn status_message(code: u16) -> &'static str {
    match code {
        401 => "鉴权失败",
        403 => "访问被拒绝",
        404 => "未找到",
        408 => "请求超时",
        429 => "请求过于频繁",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

impl From<RequestError> for String {
    fn from(error: RequestError) -> Self {
        error.to_string()
    }
}

/// 配置校验错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置项 {field} 无效：{reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("读取配置文件失败：{0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置失败：{0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
