//! # 图片加载配置
//!
//! ## 设计思路
//!
//! 图片加载的全部可调项：缓存容量、单张体积与解码上限、降采样方式。
//! 调用方通常只需选一个性能档位，由档位决定滤镜和输出尺寸上限。
//!
//! ## 实现思路
//!
//! - `Default` 即 balanced 档位，缓存容量 10 MiB。
//! - 三个档位集中在一张表里：名称、输出尺寸上限、滤镜。

use std::str::FromStr;

use image::imageops::FilterType;

use crate::error::ConfigError;

/// 默认内存缓存容量（字节）。
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

/// 图片加载配置。
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// `ImageLoader::from_config` 创建私有缓存时使用的容量（字节）。
    pub cache_capacity_bytes: u64,
    /// 单张图片原始字节上限（用于 Data URL 预估）。
    pub max_file_size: u64,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    /// 未指定目标尺寸时，输出宽/高单边最大值。
    pub max_output_dimension: u32,
    /// 降采样滤镜策略。
    pub resize_filter: FilterType,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            max_file_size: 20 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            max_output_dimension: ImagePerformanceProfile::Balanced.max_output_dimension(),
            resize_filter: ImagePerformanceProfile::Balanced.resize_filter(),
        }
    }
}

/// 图片性能档位，决定降采样滤镜与输出尺寸上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePerformanceProfile {
    Quality,
    Balanced,
    Speed,
}

impl ImagePerformanceProfile {
    pub const ALL: [ImagePerformanceProfile; 3] = [Self::Quality, Self::Balanced, Self::Speed];

    /// `(名称, 输出尺寸上限, 滤镜)`
    fn settings(self) -> (&'static str, u32, FilterType) {
        match self {
            Self::Quality => ("quality", 8192, FilterType::CatmullRom),
            Self::Balanced => ("balanced", 2560, FilterType::Triangle),
            Self::Speed => ("speed", 1920, FilterType::Nearest),
        }
    }

    pub fn as_str(self) -> &'static str {
        self.settings().0
    }

    /// 输出宽/高单边上限。
    pub fn max_output_dimension(self) -> u32 {
        self.settings().1
    }

    pub fn resize_filter(self) -> FilterType {
        self.settings().2
    }
}

impl FromStr for ImagePerformanceProfile {
    type Err = ConfigError;

    /// 大小写与首尾空白不敏感。
    ///
    /// # 示例
    /// ```rust
    /// use netqueue::image::ImagePerformanceProfile;
    ///
    /// let profile: ImagePerformanceProfile = " Speed ".parse()?;
    /// assert_eq!(profile.max_output_dimension(), 1920);
    /// # Ok::<(), netqueue::ConfigError>(())
    /// ```
    fn from_str(name: &str) -> Result<Self, ConfigError> {
        let wanted = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|profile| profile.as_str() == wanted)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "performance_profile",
                    format!("未知性能档位：{}（可选：quality / balanced / speed）", wanted),
                )
            })
    }
}

impl ImageConfig {
    pub fn with_profile(profile: ImagePerformanceProfile) -> Self {
        let mut config = Self::default();
        config.apply_performance_profile(profile);
        config
    }

    /// 由当前滤镜与尺寸上限推断档位；自定义组合按最接近的档位归类。
    pub fn performance_profile(&self) -> ImagePerformanceProfile {
        if self.max_output_dimension >= ImagePerformanceProfile::Quality.max_output_dimension() {
            ImagePerformanceProfile::Quality
        } else if self.max_output_dimension <= ImagePerformanceProfile::Speed.max_output_dimension()
            || self.resize_filter == FilterType::Nearest
        {
            ImagePerformanceProfile::Speed
        } else {
            ImagePerformanceProfile::Balanced
        }
    }

    pub fn apply_performance_profile(&mut self, profile: ImagePerformanceProfile) {
        self.max_output_dimension = profile.max_output_dimension();
        self.resize_filter = profile.resize_filter();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity_bytes == 0 {
            return Err(ConfigError::invalid("cache_capacity_bytes", "不能为 0"));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::invalid("max_file_size", "不能为 0"));
        }
        if self.max_decoded_pixels == 0 || self.max_decoded_bytes == 0 {
            return Err(ConfigError::invalid("max_decoded_pixels", "解码上限不能为 0"));
        }
        if self.max_output_dimension == 0 {
            return Err(ConfigError::invalid("max_output_dimension", "不能为 0"));
        }

        Ok(())
    }
}
