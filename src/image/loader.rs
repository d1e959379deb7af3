//! # 图片加载器
//!
//! ## 设计思路
//!
//! 在调度器之上提供“按地址 + 目标尺寸取图”的能力：
//! - 先查内存缓存，命中与未命中走同一条交付路径
//! - 相同键的并发加载合并为一次网络请求，所有等待者收到同一结果
//! - 请求被取消时，所有等待者都收到 `Cancelled`，进行中条目随之清理
//!
//! ## 实现思路
//!
//! - 缓存键为 `#W{宽}#H{高}{地址}`，不同目标尺寸的降采样结果分别缓存。
//! - 进行中表 `in_flight` 以代号（generation）区分同键的先后两次请求，
//!   避免旧请求的收尾误删新条目。
//! - 请求回调共同持有一个 `Completion`；回调在取消时被直接丢弃，
//!   `Completion` 的析构负责把 `Cancelled` 通知给剩余等待者。
//! - 提交请求与取消请求都在 `in_flight` 锁之外进行，避免与调度器登记表互相等待。
//! - `ImageSlot` 绑定固定显示尺寸，新地址覆盖旧地址，旧结果一律丢弃。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::cache::BoundedImageCache;
use super::config::ImageConfig;
use super::pipeline::ImageDecoder;
use super::source::{DecodedImage, is_data_url, parse_data_url};
use crate::dispatcher::{Dispatcher, RequestId};
use crate::error::{ConfigError, RequestError};
use crate::request::{DecodeStrategy, Method, Priority, Request};

/// 图片请求统一使用的标签，可通过 `Dispatcher::cancel_all` 批量取消。
pub const IMAGE_REQUEST_TAG: &str = "netqueue.image";

pub type ImageResult = Result<Arc<DecodedImage>, RequestError>;

type Waiter = Box<dyn FnOnce(ImageResult) + Send>;

/// 图片缓存键：`#W{width}#H{height}{url}`。
pub fn image_cache_key(url: &str, width: u32, height: u32) -> String {
    format!("#W{}#H{}{}", width, height, url)
}

struct InFlight {
    generation: u64,
    request: Option<RequestId>,
    waiters: Vec<(u64, Waiter)>,
}

struct LoaderState {
    cache: Arc<BoundedImageCache>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
    next_waiter: AtomicU64,
}

impl LoaderState {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("图片进行中表锁中毒，继续使用恢复数据");
                poisoned.into_inner()
            }
        }
    }

    fn take_waiters(&self, key: &str, generation: u64) -> Vec<Waiter> {
        let mut in_flight = self.in_flight();
        if !in_flight.get(key).is_some_and(|entry| entry.generation == generation) {
            return Vec::new();
        }

        in_flight
            .remove(key)
            .map(|entry| entry.waiters.into_iter().map(|(_, waiter)| waiter).collect())
            .unwrap_or_default()
    }

    /// 移除一个等待者。它是最后一个等待者时连同条目一起移除，并返回需要取消的请求。
    fn detach(&self, key: &str, generation: u64, waiter_id: u64) -> (Option<Waiter>, Option<RequestId>) {
        let mut in_flight = self.in_flight();
        let Some(entry) = in_flight.get_mut(key).filter(|entry| entry.generation == generation) else {
            return (None, None);
        };
        let Some(position) = entry.waiters.iter().position(|(id, _)| *id == waiter_id) else {
            return (None, None);
        };

        let (_, removed) = entry.waiters.remove(position);
        if !entry.waiters.is_empty() {
            return (Some(removed), None);
        }

        let orphaned = in_flight.remove(key).and_then(|entry| entry.request);
        (Some(removed), orphaned)
    }
}

/// 一次网络加载的收尾：写缓存、通知全部等待者。至多执行一次。
struct Completion {
    key: String,
    generation: u64,
    state: Arc<LoaderState>,
    done: AtomicBool,
}

impl Completion {
    fn complete(&self, outcome: ImageResult) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(image) = &outcome {
            self.state.cache.put(self.key.clone(), image.clone());
        }

        let waiters = self.state.take_waiters(&self.key, self.generation);
        match &outcome {
            Ok(image) => log::debug!(
                "🖼️ 图片加载完成 - {}x{}，通知 {} 个等待者",
                image.width(),
                image.height(),
                waiters.len()
            ),
            Err(error) => log::debug!("图片加载失败（{}），通知 {} 个等待者", error, waiters.len()),
        }

        for waiter in waiters {
            waiter(outcome.clone());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !*self.done.get_mut() {
            self.complete(Err(RequestError::Cancelled));
        }
    }
}

/// 单个等待者的取消凭据。
#[derive(Clone)]
pub struct ImageTicket {
    key: String,
    generation: u64,
    waiter_id: u64,
    state: Arc<LoaderState>,
    dispatcher: Dispatcher,
}

impl ImageTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 撤销本等待者；没有其他等待者时同时取消底层请求。
    ///
    /// 等待者已收到结果时返回 `false`。
    pub fn cancel(&self) -> bool {
        let (removed, orphaned) = self.state.detach(&self.key, self.generation, self.waiter_id);
        if let Some(id) = orphaned {
            log::debug!("图片请求 {} 已无等待者，取消", id);
            self.dispatcher.cancel(id);
        }
        removed.is_some()
    }
}

impl fmt::Debug for ImageTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTicket")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("waiter_id", &self.waiter_id)
            .finish()
    }
}

/// `ImageLoader::load` 返回的句柄，本身是一个 `Future`。
#[derive(Debug)]
pub struct ImageHandle {
    ticket: ImageTicket,
    receiver: oneshot::Receiver<ImageResult>,
}

impl ImageHandle {
    pub fn ticket(&self) -> &ImageTicket {
        &self.ticket
    }

    pub fn cancel(&self) -> bool {
        self.ticket.cancel()
    }
}

impl Future for ImageHandle {
    type Output = ImageResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Cancelled)))
    }
}

enum Attach {
    Joined(u64),
    Leader(u64),
    Cached(Arc<DecodedImage>, Waiter),
}

#[derive(Clone)]
pub struct ImageLoader {
    dispatcher: Dispatcher,
    config: Arc<ImageConfig>,
    state: Arc<LoaderState>,
}

impl ImageLoader {
    pub fn new(dispatcher: Dispatcher, cache: Arc<BoundedImageCache>, config: ImageConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            dispatcher,
            config: Arc::new(config),
            state: Arc::new(LoaderState {
                cache,
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                next_waiter: AtomicU64::new(1),
            }),
        })
    }

    /// 按 `config.cache_capacity_bytes` 创建独占的缓存。
    pub fn from_config(dispatcher: Dispatcher, config: ImageConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Arc::new(BoundedImageCache::new(config.cache_capacity_bytes));
        Self::new(dispatcher, cache, config)
    }

    /// 使用全进程共享的 10 MiB 缓存。
    pub fn with_shared_cache(dispatcher: Dispatcher, config: ImageConfig) -> Result<Self, ConfigError> {
        Self::new(dispatcher, BoundedImageCache::shared(), config)
    }

    pub fn cache(&self) -> &Arc<BoundedImageCache> {
        &self.state.cache
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// 直接查询缓存，不触发加载。
    pub fn cached(&self, url: &str, width: u32, height: u32) -> Option<Arc<DecodedImage>> {
        self.state.cache.get(&image_cache_key(url, width, height))
    }

    /// 加载图片。宽高为 0 表示不限制该方向。
    pub fn load(&self, url: &str, width: u32, height: u32) -> ImageHandle {
        let (sender, receiver) = oneshot::channel();
        let ticket = self.attach(
            url,
            width,
            height,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        ImageHandle { ticket, receiver }
    }

    /// 回调形式加载。缓存命中时在当前线程立即回调，否则在调度器工作线程回调。
    pub fn load_with<R, E>(&self, url: &str, width: u32, height: u32, on_ready: R, on_error: E) -> ImageTicket
    where
        R: FnOnce(Arc<DecodedImage>) + Send + 'static,
        E: FnOnce(RequestError) + Send + 'static,
    {
        self.attach(
            url,
            width,
            height,
            Box::new(move |result| match result {
                Ok(image) => on_ready(image),
                Err(error) => on_error(error),
            }),
        )
    }

    fn attach(&self, url: &str, width: u32, height: u32, waiter: Waiter) -> ImageTicket {
        let key = image_cache_key(url, width, height);
        let waiter_id = self.state.next_waiter.fetch_add(1, Ordering::Relaxed);
        let mut ticket = ImageTicket {
            key: key.clone(),
            generation: 0,
            waiter_id,
            state: self.state.clone(),
            dispatcher: self.dispatcher.clone(),
        };

        if let Some(image) = self.state.cache.get(&key) {
            log::debug!("💾 图片缓存命中 - {}x{}", image.width(), image.height());
            waiter(Ok(image));
            return ticket;
        }

        if is_data_url(url) {
            waiter(self.decode_data_url(&key, url, width, height));
            return ticket;
        }

        let attach = {
            let mut in_flight = self.state.in_flight();
            if let Some(entry) = in_flight.get_mut(&key) {
                entry.waiters.push((waiter_id, waiter));
                Attach::Joined(entry.generation)
            } else if let Some(image) = self.state.cache.get(&key) {
                Attach::Cached(image, waiter)
            } else {
                let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
                in_flight.insert(
                    key.clone(),
                    InFlight {
                        generation,
                        request: None,
                        waiters: vec![(waiter_id, waiter)],
                    },
                );
                Attach::Leader(generation)
            }
        };

        let generation = match attach {
            Attach::Cached(image, waiter) => {
                waiter(Ok(image));
                return ticket;
            }
            Attach::Joined(generation) => {
                log::debug!("🔗 合并到进行中的图片请求");
                ticket.generation = generation;
                return ticket;
            }
            Attach::Leader(generation) => generation,
        };
        ticket.generation = generation;

        let completion = Arc::new(Completion {
            key: key.clone(),
            generation,
            state: self.state.clone(),
            done: AtomicBool::new(false),
        });
        let on_success = {
            let completion = completion.clone();
            move |image: DecodedImage| completion.complete(Ok(Arc::new(image)))
        };
        let on_failure = move |error: RequestError| completion.complete(Err(error));

        let request = Request::new(Method::Get, url, ImageDecoder::new(width, height, self.config.clone()))
            .priority(Priority::Low)
            .tag(IMAGE_REQUEST_TAG)
            .should_cache(false);
        let id = self.dispatcher.submit_with(request, on_success, on_failure);

        let orphaned = {
            let mut in_flight = self.state.in_flight();
            match in_flight.get_mut(&key) {
                Some(entry) if entry.generation == generation => {
                    entry.request = Some(id);
                    false
                }
                _ => true,
            }
        };
        if orphaned {
            self.dispatcher.cancel(id);
        }

        ticket
    }

    fn decode_data_url(&self, key: &str, url: &str, width: u32, height: u32) -> ImageResult {
        let bytes = parse_data_url(url, self.config.max_file_size)?;
        let image = Arc::new(ImageDecoder::new(width, height, self.config.clone()).decode(&bytes)?);
        self.state.cache.put(key, image.clone());
        log::debug!("📝 Data URL 图片已本地解码 - {}x{}", image.width(), image.height());
        Ok(image)
    }
}

impl fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("cached", &self.state.cache.len())
            .field("in_flight", &self.state.in_flight().len())
            .finish()
    }
}

type SlotListener = Arc<dyn Fn(ImageResult) + Send + Sync>;

struct SlotState {
    width: u32,
    height: u32,
    url: Option<String>,
    generation: u64,
    ticket: Option<ImageTicket>,
}

/// 绑定显示尺寸的图片槽位。
///
/// 每次 `set_url` 都按槽位尺寸加载并覆盖上一次加载：上一次的等待者被撤销，
/// 迟到的旧结果不会交给监听器。
pub struct ImageSlot {
    loader: ImageLoader,
    listener: SlotListener,
    state: Arc<Mutex<SlotState>>,
}

impl ImageSlot {
    pub fn new<L>(loader: ImageLoader, width: u32, height: u32, listener: L) -> Self
    where
        L: Fn(ImageResult) + Send + Sync + 'static,
    {
        Self {
            loader,
            listener: Arc::new(listener),
            state: Arc::new(Mutex::new(SlotState {
                width,
                height,
                url: None,
                generation: 0,
                ticket: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        lock_slot(&self.state)
    }

    pub fn url(&self) -> Option<String> {
        self.lock().url.clone()
    }

    pub fn size(&self) -> (u32, u32) {
        let state = self.lock();
        (state.width, state.height)
    }

    /// 显示新地址，覆盖上一次加载。
    pub fn set_url(&self, url: &str) {
        let (generation, width, height, previous) = {
            let mut state = self.lock();
            state.generation += 1;
            state.url = Some(url.to_string());
            (state.generation, state.width, state.height, state.ticket.take())
        };

        if let Some(previous) = previous {
            previous.cancel();
        }

        let on_ready = {
            let state = self.state.clone();
            let listener = self.listener.clone();
            move |image: Arc<DecodedImage>| {
                if lock_slot(&state).generation == generation {
                    listener(Ok(image));
                } else {
                    log::debug!("丢弃过期的图片结果");
                }
            }
        };
        let on_error = {
            let state = self.state.clone();
            let listener = self.listener.clone();
            move |error: RequestError| {
                if lock_slot(&state).generation == generation {
                    listener(Err(error));
                }
            }
        };

        let ticket = self.loader.load_with(url, width, height, on_ready, on_error);

        let mut state = self.lock();
        if state.generation == generation {
            state.ticket = Some(ticket);
        } else {
            drop(state);
            ticket.cancel();
        }
    }

    /// 更新显示尺寸；尺寸变化且已有地址时按新尺寸重新加载。
    pub fn set_size(&self, width: u32, height: u32) {
        let url = {
            let mut state = self.lock();
            if (state.width, state.height) == (width, height) {
                return;
            }
            state.width = width;
            state.height = height;
            state.url.clone()
        };

        if let Some(url) = url {
            self.set_url(&url);
        }
    }

    /// 清空槽位并撤销进行中的加载。
    pub fn clear(&self) {
        let previous = {
            let mut state = self.lock();
            state.generation += 1;
            state.url = None;
            state.ticket.take()
        };

        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

fn lock_slot(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Drop for ImageSlot {
    fn drop(&mut self) {
        self.clear();
    }
}
