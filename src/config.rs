//! # 调度器配置
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `DispatcherConfig`：工作线程数、传输层超时与体积上限、
//! 响应缓存容量与新鲜度。`Default` 提供生产可用的保守配置。
//!
//! ## 实现思路
//!
//! - 支持从 JSON 文件 / 字符串加载，缺失字段回落到默认值。
//! - `validate` 对每个字段做范围校验，调度器构造时强制执行。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 调度器与 HTTP 传输层配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 并行执行网络请求的工作线程数。
    pub worker_threads: usize,
    /// 建立连接（TCP/TLS）超时时间（毫秒）。
    pub connect_timeout_ms: u64,
    /// 响应体分块读取超时时间（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 单个响应体允许的最大体积（字节）。
    pub max_body_bytes: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 请求使用的 User-Agent。
    pub user_agent: String,
    /// 响应缓存最多保留的条目数。
    pub response_cache_entries: usize,
    /// 服务器未给出缓存头时的默认新鲜期（秒），0 表示不缓存。
    pub default_cache_ttl_secs: u64,
    /// 过期后仍可作为占位结果返回的宽限期（秒）。
    pub stale_while_revalidate_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            connect_timeout_ms: 8_000,
            stream_chunk_timeout_ms: 15_000,
            max_body_bytes: 50 * 1024 * 1024,
            max_redirects: 5,
            user_agent: format!("netqueue/{}", env!("CARGO_PKG_VERSION")),
            response_cache_entries: 256,
            default_cache_ttl_secs: 0,
            stale_while_revalidate_secs: 0,
        }
    }
}

impl DispatcherConfig {
    /// 从 JSON 字符串加载配置，未出现的字段使用默认值。
    ///
    /// # 示例
    /// ```rust
    /// use netqueue::DispatcherConfig;
    ///
    /// let config = DispatcherConfig::from_json_str(r#"{"worker_threads": 2}"#)?;
    /// assert_eq!(config.worker_threads, 2);
    /// # Ok::<(), netqueue::ConfigError>(())
    /// ```
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.worker_threads) {
            return Err(ConfigError::invalid("worker_threads", "必须在 1~64 之间"));
        }
        if !(100..=120_000).contains(&self.connect_timeout_ms) {
            return Err(ConfigError::invalid("connect_timeout_ms", "必须在 100~120000 毫秒之间"));
        }
        if !(100..=300_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(ConfigError::invalid("stream_chunk_timeout_ms", "必须在 100~300000 毫秒之间"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid("max_body_bytes", "不能为 0"));
        }
        if self.max_redirects > 20 {
            return Err(ConfigError::invalid("max_redirects", "不能超过 20"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::invalid("user_agent", "不能为空"));
        }
        if self.response_cache_entries == 0 {
            return Err(ConfigError::invalid("response_cache_entries", "不能为 0"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stream_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_chunk_timeout_ms)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl_secs)
    }

    pub fn stale_while_revalidate(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }
}
