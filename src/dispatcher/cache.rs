//! # 响应缓存
//!
//! ## 设计思路
//!
//! 按 `Request::cache_key` 保存原始响应体，而不是解码后的值：同一份缓存可被
//! 不同解码策略复用，缓存层也无需了解任何具体类型。
//!
//! ## 实现思路
//!
//! - `lru::LruCache` 按条目数限制容量，外层一把 `Mutex`，从不跨 I/O 持锁。
//! - 新鲜期来自 `Cache-Control: max-age` / `Expires`，缺省回落到配置值；
//!   `no-store` 的响应不入缓存；`no-cache` 的响应只保存校验信息与内容，每次都要条件请求确认。
//! - 过了新鲜期但仍在宽限期内的条目是“陈旧”的：先交付给调用方，再后台刷新。
//! - 条目保留 `ETag` / `Last-Modified`，用于条件请求；收到 304 时只刷新新鲜期。

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::transport::TransportResponse;

/// 单个条目的新鲜期与宽限期上限，避免 `Instant` 溢出。
const MAX_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// 缓存命中情况。
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(Bytes),
    /// 已过期但仍在宽限期内，可先交付再刷新。
    Stale(Bytes),
    Miss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Bytes,
    etag: Option<String>,
    last_modified: Option<String>,
    fresh_until: Instant,
    stale_until: Instant,
    always_revalidate: bool,
}

/// 从响应头解析出的缓存指令。
#[derive(Debug, Default, PartialEq)]
struct CacheDirectives {
    no_store: bool,
    /// 可以保存，但每次使用前都必须先向服务器确认。
    no_cache: bool,
    max_age: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
}

impl CacheDirectives {
    fn parse(response: &TransportResponse) -> Self {
        let mut directives = Self::default();
        let Some(header) = response.header("cache-control") else {
            return directives;
        };

        for directive in header.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (directive.as_str(), None),
            };
            let seconds = value.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs);

            match name {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "max-age" => directives.max_age = seconds,
                "stale-while-revalidate" => directives.stale_while_revalidate = seconds,
                _ => {}
            }
        }

        directives
    }

    fn grace(&self, fallback: Duration) -> Duration {
        if self.no_cache {
            return Duration::ZERO;
        }
        self.stale_while_revalidate.unwrap_or(fallback).min(MAX_LIFETIME)
    }
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    default_ttl: Duration,
    stale_grace: Duration,
}

impl ResponseCache {
    pub fn new(capacity: NonZeroUsize, default_ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl,
            stale_grace,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, LruCache<String, CacheEntry>>> {
        match self.entries.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("⚠️ 响应缓存锁中毒，本次按未命中处理");
                None
            }
        }
    }

    pub fn lookup(&self, key: &str) -> CacheLookup {
        let Some(mut entries) = self.lock() else {
            return CacheLookup::Miss;
        };
        let Some(entry) = entries.get(key) else {
            return CacheLookup::Miss;
        };

        let now = Instant::now();
        if now < entry.fresh_until {
            CacheLookup::Fresh(entry.body.clone())
        } else if now < entry.stale_until {
            CacheLookup::Stale(entry.body.clone())
        } else {
            CacheLookup::Miss
        }
    }

    /// 条件请求头：`If-None-Match` / `If-Modified-Since`。
    pub fn validators(&self, key: &str) -> Vec<(String, String)> {
        let Some(entries) = self.lock() else {
            return Vec::new();
        };
        let Some(entry) = entries.peek(key) else {
            return Vec::new();
        };

        let mut headers = Vec::new();
        if let Some(etag) = &entry.etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(last_modified) = &entry.last_modified {
            headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
        }
        headers
    }

    /// 保存成功响应，返回是否实际入缓存。
    pub fn store(&self, key: &str, response: &TransportResponse) -> bool {
        let directives = CacheDirectives::parse(response);
        let etag = response.header("etag").map(str::to_string);
        let last_modified = response.header("last-modified").map(str::to_string);

        let Some(mut entries) = self.lock() else {
            return false;
        };

        if directives.no_store {
            entries.pop(key);
            return false;
        }

        let ttl = self.freshness(&directives, response);
        let grace = directives.grace(self.stale_grace);
        if ttl.is_zero() && grace.is_zero() && etag.is_none() && last_modified.is_none() {
            entries.pop(key);
            return false;
        }

        let now = Instant::now();
        let fresh_until = now + ttl;
        entries.put(
            key.to_string(),
            CacheEntry {
                body: response.body.clone(),
                etag,
                last_modified,
                fresh_until,
                stale_until: fresh_until + grace,
                always_revalidate: directives.no_cache,
            },
        );
        log::debug!("💾 响应已缓存 - ttl={}s", ttl.as_secs());
        true
    }

    /// 处理 304：刷新新鲜期并返回已缓存的响应体。
    pub fn revalidated(&self, key: &str, response: &TransportResponse) -> Option<Bytes> {
        let mut directives = CacheDirectives::parse(response);
        let mut entries = self.lock()?;
        let entry = entries.get_mut(key)?;

        directives.no_cache |= entry.always_revalidate;
        entry.always_revalidate = directives.no_cache;
        let ttl = self.freshness(&directives, response);
        let grace = directives.grace(self.stale_grace);

        let now = Instant::now();
        entry.fresh_until = now + ttl;
        entry.stale_until = entry.fresh_until + grace;
        if let Some(etag) = response.header("etag") {
            entry.etag = Some(etag.to_string());
        }
        Some(entry.body.clone())
    }

    /// 标记为陈旧但不删除：下次命中时先交付旧值再刷新。
    pub fn invalidate(&self, key: &str) {
        if let Some(mut entries) = self.lock() {
            if let Some(entry) = entries.peek_mut(key) {
                let now = Instant::now();
                entry.fresh_until = now;
                if entry.stale_until <= now && !entry.always_revalidate {
                    entry.stale_until = now + self.stale_grace.max(self.default_ttl).min(MAX_LIFETIME);
                }
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().is_some_and(|mut entries| entries.pop(key).is_some())
    }

    pub fn clear(&self) {
        if let Some(mut entries) = self.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn freshness(&self, directives: &CacheDirectives, response: &TransportResponse) -> Duration {
        if directives.no_cache {
            return Duration::ZERO;
        }
        self.declared_freshness(directives, response).min(MAX_LIFETIME)
    }

    fn declared_freshness(&self, directives: &CacheDirectives, response: &TransportResponse) -> Duration {
        if let Some(max_age) = directives.max_age {
            return max_age;
        }

        if let Some(expires) = response.header("expires") {
            return match DateTime::parse_from_rfc2822(expires) {
                Ok(at) => (at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                Err(_) => Duration::ZERO,
            };
        }

        self.default_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> ResponseCache {
        ResponseCache::new(
            NonZeroUsize::new(capacity).expect("non-zero capacity"),
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    #[test]
    fn max_age_response_is_fresh() {
        let cache = cache(4);
        let response = TransportResponse::new(200, "body").with_header("Cache-Control", "public, max-age=60");

        assert!(cache.store("GET a", &response));
        assert_eq!(cache.lookup("GET a"), CacheLookup::Fresh(Bytes::from_static(b"body")));
    }

    #[test]
    fn no_store_and_uncacheable_responses_are_skipped() {
        let cache = cache(4);

        assert!(!cache.store("k", &TransportResponse::new(200, "x").with_header("Cache-Control", "no-store")));
        assert!(!cache.store("k", &TransportResponse::new(200, "x")));
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
    }

    #[test]
    fn expires_in_the_past_keeps_only_validators() {
        let cache = cache(4);
        let response = TransportResponse::new(200, "x")
            .with_header("Expires", "Wed, 21 Oct 2015 07:28:00 GMT")
            .with_header("ETag", "\"abc\"");

        assert!(cache.store("k", &response));
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
        assert_eq!(
            cache.validators("k"),
            vec![("If-None-Match".to_string(), "\"abc\"".to_string())]
        );
    }

    #[test]
    fn invalidate_marks_stale_without_removing() {
        let cache = cache(4);
        let response = TransportResponse::new(200, "old").with_header("Cache-Control", "max-age=600");
        cache.store("k", &response);

        cache.invalidate("k");

        assert_eq!(cache.lookup("k"), CacheLookup::Stale(Bytes::from_static(b"old")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn not_modified_refreshes_entry() {
        let cache = cache(4);
        cache.store(
            "k",
            &TransportResponse::new(200, "cached").with_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        let body = cache.revalidated("k", &TransportResponse::new(304, "").with_header("Cache-Control", "max-age=30"));

        assert_eq!(body, Some(Bytes::from_static(b"cached")));
        assert_eq!(cache.lookup("k"), CacheLookup::Fresh(Bytes::from_static(b"cached")));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = cache(2);
        let response = TransportResponse::new(200, "x").with_header("Cache-Control", "max-age=60");
        cache.store("a", &response);
        cache.store("b", &response);
        let _ = cache.lookup("a");
        cache.store("c", &response);

        assert_eq!(cache.lookup("b"), CacheLookup::Miss);
        assert!(matches!(cache.lookup("a"), CacheLookup::Fresh(_)));
        assert!(cache.remove("c"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn no_cache_response_is_kept_for_revalidation_only() {
        let cache = cache(4);
        let response = TransportResponse::new(200, "body")
            .with_header("Cache-Control", "no-cache, max-age=600")
            .with_header("ETag", "\"n1\"");

        assert!(cache.store("k", &response));
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
        assert_eq!(
            cache.validators("k"),
            vec![("If-None-Match".to_string(), "\"n1\"".to_string())]
        );

        let refreshed = cache.revalidated("k", &TransportResponse::new(304, "").with_header("Cache-Control", "max-age=30"));
        assert_eq!(refreshed, Some(Bytes::from_static(b"body")));
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);

        cache.invalidate("k");
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);

        assert!(!cache.store("plain", &TransportResponse::new(200, "x").with_header("Cache-Control", "no-cache")));
    }

    #[test]
    fn absurd_max_age_is_clamped() {
        let cache = cache(1);
        let response = TransportResponse::new(200, "x").with_header("Cache-Control", "max-age=18446744073709551615");

        assert!(cache.store("k", &response));
        assert!(matches!(cache.lookup("k"), CacheLookup::Fresh(_)));
    }
}
