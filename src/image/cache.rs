//! # 有界图片缓存
//!
//! ## 设计思路
//!
//! 按解码后的字节开销（`width * height * 4`）而不是条目数限制容量：
//! 一张大图与几十张缩略图占用的内存差异巨大，只有按字节记账才能真正约束内存。
//!
//! ## 实现思路
//!
//! - `lru::LruCache` 只负责访问顺序（不限条目数），容量由 `total_bytes` 自行记账。
//! - `put` 先替换同键旧条目，再从最久未使用端逐出，直到 `total + cost <= capacity`。
//! - 单条开销超过总容量的条目不入缓存。
//! - 全部操作在一把 `Mutex` 内完成；锁中毒时降级为未命中 / 空操作。

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use once_cell::sync::Lazy;

use super::config::DEFAULT_CACHE_CAPACITY_BYTES;
use super::source::DecodedImage;

static SHARED_CACHE: Lazy<Arc<BoundedImageCache>> =
    Lazy::new(|| Arc::new(BoundedImageCache::new(DEFAULT_CACHE_CAPACITY_BYTES)));

struct CacheState {
    entries: LruCache<String, Arc<DecodedImage>>,
    total_bytes: u64,
}

pub struct BoundedImageCache {
    capacity_bytes: u64,
    state: Mutex<CacheState>,
}

impl BoundedImageCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    /// 全进程共享的 10 MiB 缓存。
    pub fn shared() -> Arc<BoundedImageCache> {
        SHARED_CACHE.clone()
    }

    fn lock(&self) -> Option<MutexGuard<'_, CacheState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("⚠️ 图片缓存锁中毒，本次操作降级跳过");
                None
            }
        }
    }

    /// 读取并将条目提升为最近使用。
    pub fn get(&self, key: &str) -> Option<Arc<DecodedImage>> {
        let mut state = self.lock()?;
        state.entries.get(key).cloned()
    }

    /// 写入条目，必要时逐出最久未使用的条目。返回是否实际入缓存。
    pub fn put(&self, key: impl Into<String>, image: Arc<DecodedImage>) -> bool {
        let key = key.into();
        let cost = image.byte_cost();
        let Some(mut state) = self.lock() else {
            return false;
        };

        if let Some(previous) = state.entries.pop(&key) {
            state.total_bytes -= previous.byte_cost();
        }

        if cost > self.capacity_bytes {
            log::debug!("图片开销 {} 字节超过缓存容量，不入缓存", cost);
            return false;
        }

        while state.total_bytes + cost > self.capacity_bytes {
            let Some((_, evicted)) = state.entries.pop_lru() else {
                break;
            };
            state.total_bytes -= evicted.byte_cost();
        }

        state.entries.put(key, image);
        state.total_bytes += cost;
        true
    }

    pub fn remove(&self, key: &str) -> Option<Arc<DecodedImage>> {
        let mut state = self.lock()?;
        let removed = state.entries.pop(key)?;
        state.total_bytes -= removed.byte_cost();
        Some(removed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().is_some_and(|state| state.entries.contains(key))
    }

    pub fn clear(&self) {
        if let Some(mut state) = self.lock() {
            state.entries.clear();
            state.total_bytes = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().map(|state| state.total_bytes).unwrap_or(0)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn image(width: u32, height: u32) -> Arc<DecodedImage> {
        let pixels = vec![0u8; (width * height * 4) as usize];
        Arc::new(DecodedImage::from_rgba(width, height, pixels).expect("valid image"))
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = BoundedImageCache::new(300);
        cache.put("a", image(5, 5));
        cache.put("b", image(5, 5));
        cache.put("c", image(5, 5));
        assert!(cache.get("a").is_some());

        cache.put("d", image(5, 5));

        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.total_bytes(), 300);
    }

    #[test]
    fn replacing_key_updates_accounting() {
        let cache = BoundedImageCache::new(1_000);
        cache.put("a", image(10, 10));
        cache.put("a", image(5, 5));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 100);
    }

    #[test]
    fn oversized_entry_is_not_stored_and_drops_previous() {
        let cache = BoundedImageCache::new(100);
        assert!(cache.put("a", image(5, 5)));

        assert!(!cache.put("a", image(10, 10)));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn remove_and_clear_release_bytes() {
        let cache = BoundedImageCache::new(1_000);
        cache.put("a", image(5, 5));
        cache.put("b", image(5, 5));

        assert!(cache.remove("a").is_some());
        assert_eq!(cache.total_bytes(), 100);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn shared_cache_is_a_singleton() {
        let first = BoundedImageCache::shared();
        let second = BoundedImageCache::shared();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.capacity(), 10 * 1024 * 1024);
    }

    proptest! {
        #[test]
        fn total_never_exceeds_capacity(
            capacity in 1u64..4_000,
            ops in proptest::collection::vec((0u8..8, 1u32..20, 1u32..20), 1..64),
        ) {
            let cache = BoundedImageCache::new(capacity);
            for (key, width, height) in ops {
                cache.put(format!("k{}", key), image(width, height));
                prop_assert!(cache.total_bytes() <= capacity);
            }
        }
    }
}
