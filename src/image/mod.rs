//! # 图片模块
//!
//! ## 设计思路
//!
//! 图片加载是调度器的一个上层用例：网络字节经 `ImageDecoder` 解码为 RGBA，
//! 按字节开销存入有界 LRU 缓存，并对相同请求去重。
//!
//! ## 模块结构
//!
//! - `cache`：按字节记账的 LRU 缓存（`BoundedImageCache`）
//! - `config`：加载配置与性能档位
//! - `loader`：去重加载器（`ImageLoader`）与自动尺寸槽位（`ImageSlot`）
//! - `pipeline`：解码与降采样策略（`ImageDecoder`）
//! - `source`：Data URL 解析与 `DecodedImage`

pub mod cache;
pub mod config;
pub mod loader;
pub mod pipeline;
pub mod source;

pub use cache::BoundedImageCache;
pub use config::{DEFAULT_CACHE_CAPACITY_BYTES, ImageConfig, ImagePerformanceProfile};
pub use loader::{IMAGE_REQUEST_TAG, ImageHandle, ImageLoader, ImageResult, ImageSlot, ImageTicket, image_cache_key};
pub use pipeline::ImageDecoder;
pub use source::DecodedImage;
