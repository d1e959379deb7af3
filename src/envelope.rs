//! # 返回信封编解码
//!
//! ## 设计思路
//!
//! 后端必须遵守 `{error_code:int, reason:string, result:string}` 这一固定契约。
//! 本模块把原始响应字节规整为 `ResultEnvelope`：要么完整的成功形态，
//! 要么完整的错误形态，不存在“半填充”的中间状态。
//!
//! ## 实现思路
//!
//! - 先解析为 `serde_json::Value`，再逐字段做宽松转换（数字字符串视为整数、
//!   非字符串的 `result` 重新序列化为 JSON 文本），与原有 JSON 库的取值行为一致。
//! - 解析失败统一归类为 `MalformedEnvelope`，错误码固定为 `-1`。
//! - 列表解码逐项容错：某一项映射失败只跳过该项，不影响整批结果。
//! - 全部为纯函数，同样输入永远得到同样输出。

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RequestError;

/// 规整后的返回信封。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultEnvelope {
    error_code: i64,
    reason: String,
    result: String,
    #[serde(skip)]
    failure: Option<RequestError>,
}

impl ResultEnvelope {
    /// 成功形态：`error_code = 0`，`reason` 为空。
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            error_code: 0,
            reason: String::new(),
            result: result.into(),
            failure: None,
        }
    }

    /// 错误形态：错误码与文案都由分类结果推导，`result` 为空。
    pub fn failure(error: &RequestError) -> Self {
        Self {
            error_code: error.envelope_code(),
            reason: error.to_string(),
            result: String::new(),
            failure: Some(error.clone()),
        }
    }

    pub fn error_code(&self) -> i64 {
        self.error_code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// 附着在错误信封上的分类；成功信封返回 `None`。
    pub fn failure_kind(&self) -> Option<&RequestError> {
        self.failure.as_ref()
    }

    /// 成功时取出 `result` 载荷，失败时返回分类错误。
    pub fn into_result(self) -> Result<String, RequestError> {
        match self.failure {
            None => Ok(self.result),
            Some(error) => Err(error),
        }
    }

    /// 按后端契约重新编码为 JSON。
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error_code": self.error_code,
            "reason": self.reason,
            "result": self.result,
        })
        .to_string()
    }
}

/// 将原始响应字节解码为信封。
///
/// # 示例
/// ```rust
/// use netqueue::envelope::decode_envelope;
///
/// let envelope = decode_envelope(Some(br#"{"error_code":0,"reason":"","result":"ok"}"#));
/// assert!(envelope.is_success());
/// assert_eq!(envelope.result(), "ok");
/// ```
pub fn decode_envelope(raw: Option<&[u8]>) -> ResultEnvelope {
    let Some(bytes) = raw.filter(|bytes| !is_blank(bytes)) else {
        return ResultEnvelope::failure(&RequestError::EmptyResponse);
    };

    match parse_envelope(bytes) {
        Ok(envelope) => envelope,
        Err(error) => {
            log::debug!("📦 信封解析失败：{}", error);
            ResultEnvelope::failure(&error)
        }
    }
}

fn parse_envelope(bytes: &[u8]) -> Result<ResultEnvelope, RequestError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| RequestError::MalformedEnvelope(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(RequestError::MalformedEnvelope("顶层不是 JSON 对象".to_string()));
    };

    let error_code = fields
        .get("error_code")
        .and_then(coerce_integer)
        .ok_or_else(|| RequestError::MalformedEnvelope("缺少整数字段 error_code".to_string()))?;

    let reason = fields
        .get("reason")
        .map(coerce_text)
        .ok_or_else(|| RequestError::MalformedEnvelope("缺少字段 reason".to_string()))?;

    let result = fields
        .get("result")
        .map(coerce_text)
        .ok_or_else(|| RequestError::MalformedEnvelope("缺少字段 result".to_string()))?;

    if error_code == 0 {
        return Ok(ResultEnvelope::success(result));
    }

    Ok(ResultEnvelope::failure(&RequestError::ApplicationError {
        code: error_code,
        reason,
    }))
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 将载荷解码为单个类型化对象。
pub fn decode_object<T: DeserializeOwned>(payload: &str) -> Result<T, RequestError> {
    serde_json::from_str(payload).map_err(|e| RequestError::DecodeFailure(e.to_string()))
}

/// 将 JSON 数组载荷解码为类型化列表；无法映射的元素被跳过。
pub fn decode_list<T: DeserializeOwned>(payload: &str) -> Result<Vec<T>, RequestError> {
    let value: Value = serde_json::from_str(payload).map_err(|e| RequestError::DecodeFailure(e.to_string()))?;

    let Value::Array(items) = value else {
        return Err(RequestError::DecodeFailure("载荷不是 JSON 数组".to_string()));
    };

    Ok(collect_forgiving(items))
}

pub(crate) fn collect_forgiving<T: DeserializeOwned>(items: Vec<Value>) -> Vec<T> {
    let total = items.len();
    let decoded: Vec<T> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<T>(item) {
            Ok(bean) => Some(bean),
            Err(err) => {
                log::warn!("⚠️ 列表第 {} 项解析失败，已跳过：{}", index, err);
                None
            }
        })
        .collect();

    if decoded.len() < total {
        log::debug!("列表解析完成 - 成功 {}/{}", decoded.len(), total);
    }

    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Event {
        e_id: String,
        title: String,
    }

    #[test]
    fn empty_input_is_empty_response() {
        for raw in [None, Some(&b""[..]), Some(&b"  \n"[..])] {
            let envelope = decode_envelope(raw);
            assert_eq!(envelope.error_code(), -1);
            assert_eq!(envelope.result(), "");
            assert_eq!(envelope.failure_kind(), Some(&RequestError::EmptyResponse));
        }
    }

    #[test]
    fn malformed_input_is_classified() {
        let inputs: [&[u8]; 3] = [b"not json", b"[1,2]", br#"{"reason":"x","result":""}"#];
        for raw in inputs {
            let envelope = decode_envelope(Some(raw));
            assert_eq!(envelope.error_code(), -1);
            assert_eq!(envelope.result(), "");
            assert!(matches!(envelope.failure_kind(), Some(RequestError::MalformedEnvelope(_))));
        }
    }

    #[test]
    fn application_error_keeps_code_and_reason() {
        let envelope = decode_envelope(Some(br#"{"error_code":1,"reason":"no data","result":""}"#));

        assert_eq!(envelope.error_code(), 1);
        assert_eq!(envelope.reason(), "no data");
        assert_eq!(
            envelope.into_result(),
            Err(RequestError::ApplicationError {
                code: 1,
                reason: "no data".into()
            })
        );
    }

    #[test]
    fn coerces_numeric_string_code_and_structured_result() {
        let envelope = decode_envelope(Some(br#"{"error_code":"0","reason":null,"result":[{"e_id":"7"}]}"#));

        assert!(envelope.is_success());
        assert_eq!(envelope.result(), r#"[{"e_id":"7"}]"#);
    }

    #[test]
    fn success_list_decodes_typed_beans() {
        let envelope = decode_envelope(Some(br#"{"error_code":0,"reason":"","result":"[{\"e_id\":\"1\"}]"}"#));
        let payload = envelope.into_result().expect("success envelope");

        let events: Vec<Event> = decode_list(&payload).expect("array payload");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].e_id, "1");
        assert_eq!(events[0].title, "");
    }

    #[test]
    fn list_decode_skips_bad_items() {
        let events: Vec<Event> = decode_list(r#"[{"e_id":"1"}, 42, {"e_id":"2","extra":true}]"#).expect("array payload");

        assert_eq!(events.iter().map(|e| e.e_id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);
    }

    #[test]
    fn reencoding_success_envelope_is_idempotent() {
        let raw = br#"{"error_code":0,"reason":"","result":"[{\"e_id\":\"1\"}]"}"#;
        let first = decode_envelope(Some(raw));
        let second = decode_envelope(Some(first.to_json().as_bytes()));

        assert_eq!(first, second);
    }
}
