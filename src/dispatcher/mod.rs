//! # 请求调度器
//!
//! ## 设计思路
//!
//! 所有请求进入同一个优先级队列，由固定数量的工作线程并行执行。提交方立即返回，
//! 结果通过 `RequestHandle`（Future）或回调交付，调用方永远不在网络 I/O 上阻塞。
//!
//! 推荐在应用启动时构造一个 `Dispatcher` 并注入到需要它的组件中；
//! 确实需要全局访问时使用 `shared()`，它在首次调用时惰性创建且全进程唯一。
//!
//! ## 实现思路
//!
//! - 调度器持有独立的多线程 tokio 运行时，线程数即工作线程数。
//! - 队列（`queue.rs`）与登记表（`Mutex<HashMap>`）是仅有的共享可变状态，各自一把锁。
//! - 登记表记录所有未结束的请求，供 `cancel_all(tag)` / `cancel(id)` 查找。
//! - 关闭（`shutdown` 或最后一个句柄被丢弃）时取消全部未交付请求，
//!   并以 `shutdown_background` 结束运行时，在异步上下文中调用也是安全的。

mod cache;
mod job;
mod queue;
mod worker;

pub use cache::{CacheLookup, ResponseCache};
pub use job::{RequestHandle, RequestId, RequestState};

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::config::DispatcherConfig;
use crate::error::{ConfigError, RequestError};
use crate::request::{DecodeStrategy, Request};
use crate::transport::{HttpTransport, Transport};
use job::Job;
use queue::JobQueue;

static SHARED_DISPATCHER: OnceCell<Dispatcher> = OnceCell::new();

/// 全进程共享的调度器，首次调用时以默认配置和 `HttpTransport` 创建。
///
/// 并发首次调用也只会创建一个实例。
pub fn shared() -> Result<&'static Dispatcher, ConfigError> {
    SHARED_DISPATCHER.get_or_try_init(|| Dispatcher::with_http(DispatcherConfig::default()))
}

/// 工作线程与调度器句柄共享的状态。
pub(crate) struct Shared {
    queue: JobQueue,
    registry: Mutex<HashMap<RequestId, Arc<Job>>>,
    cache: ResponseCache,
    transport: Arc<dyn Transport>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<RequestId, Arc<Job>>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("请求登记表锁中毒，继续使用恢复数据");
                poisoned.into_inner()
            }
        }
    }

    /// 请求处理结束后从登记表移除。
    fn retire(&self, job: &Job) {
        self.registry().remove(&job.id());
    }

    /// 已取消的请求：移出登记表，并清掉队列中的残留条目。
    fn forget(&self, job: &Job) {
        self.retire(job);
        self.queue.purge_cancelled();
    }

    fn tracked(&self) -> usize {
        self.registry().len()
    }
}

struct Inner {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    next_id: AtomicU64,
}

impl Inner {
    fn shutdown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(runtime) = runtime else {
            return;
        };

        self.shared.queue.close();
        let mut dropped = 0;
        for job in self.shared.queue.drain() {
            if job.cancel() {
                dropped += 1;
            }
        }
        let remaining: Vec<Arc<Job>> = self.shared.registry().drain().map(|(_, job)| job).collect();
        for job in remaining {
            if job.cancel() {
                dropped += 1;
            }
        }

        runtime.shutdown_background();
        log::info!("🛑 调度器已关闭，丢弃 {} 个未完成请求", dropped);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 优先级请求调度器。克隆开销很小，所有克隆共享同一组工作线程。
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// 使用给定传输层创建调度器并启动工作线程。
    pub fn new(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("netqueue-worker")
            .enable_all()
            .build()?;

        let capacity = NonZeroUsize::new(config.response_cache_entries)
            .ok_or_else(|| ConfigError::invalid("response_cache_entries", "不能为 0"))?;

        let shared = Arc::new(Shared {
            queue: JobQueue::new(),
            registry: Mutex::new(HashMap::new()),
            cache: ResponseCache::new(capacity, config.default_cache_ttl(), config.stale_while_revalidate()),
            transport,
        });

        for index in 0..config.worker_threads {
            runtime.spawn(worker::run(shared.clone(), index));
        }

        log::info!(
            "✅ 调度器已启动 - 工作线程 {} 个，响应缓存 {} 条",
            config.worker_threads,
            config.response_cache_entries
        );

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                runtime: Mutex::new(Some(runtime)),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// 使用基于 `reqwest` 的 `HttpTransport` 创建调度器。
    pub fn with_http(config: DispatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(&config).map_err(|e| ConfigError::invalid("transport", e.to_string()))?;
        Self::new(config, Arc::new(transport))
    }

    /// 将已构造的调度器设为全进程共享实例。已存在共享实例时原样退回。
    pub fn install_shared(self) -> Result<&'static Dispatcher, Dispatcher> {
        SHARED_DISPATCHER.try_insert(self).map_err(|(_, rejected)| rejected)
    }

    fn enqueue<D: DecodeStrategy>(
        &self,
        request: Request<D>,
        sink: Box<dyn FnOnce(Result<D::Output, RequestError>) + Send>,
    ) -> Arc<Job> {
        let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(id, request, sink));

        if self.is_shut_down() {
            log::warn!("⚠️ 调度器已关闭，请求 {} 被丢弃", id);
            job.cancel();
            return job;
        }

        self.inner.shared.registry().insert(id, job.clone());
        self.inner.shared.queue.push(job.clone(), 1);
        if self.is_shut_down() {
            job.cancel();
            self.inner.shared.forget(&job);
            return job;
        }
        log::debug!("📥 请求 {} 已入队（优先级 {:?}）", id, job.priority());
        job
    }

    /// 提交请求并立即返回句柄；`await` 句柄即可得到解码后的结果。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use netqueue::Dispatcher;
    /// use netqueue::DispatcherConfig;
    /// use netqueue::request::{Method, Request};
    ///
    /// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher = Dispatcher::with_http(DispatcherConfig::default())?;
    /// let body = dispatcher
    ///     .submit(Request::text(Method::Get, "http://example.com/"))
    ///     .await?;
    /// println!("{}", body);
    /// # Ok(())
    /// # }
    /// ```
    pub fn submit<D: DecodeStrategy>(&self, request: Request<D>) -> RequestHandle<D::Output> {
        let (sender, receiver) = oneshot::channel();
        let job = self.enqueue(
            request,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        RequestHandle::new(job, Arc::downgrade(&self.inner.shared), receiver)
    }

    /// 回调形式提交。两个回调至多执行其一，且在工作线程上执行；
    /// 请求被取消时两者都不会执行。
    pub fn submit_with<D, S, F>(&self, request: Request<D>, on_success: S, on_failure: F) -> RequestId
    where
        D: DecodeStrategy,
        S: FnOnce(D::Output) + Send + 'static,
        F: FnOnce(RequestError) + Send + 'static,
    {
        let job = self.enqueue(
            request,
            Box::new(move |result| match result {
                Ok(value) => on_success(value),
                Err(error) => on_failure(error),
            }),
        );
        job.id()
    }

    /// 取消带指定标签、尚未交付的全部请求，返回取消数量。
    pub fn cancel_all(&self, tag: &str) -> usize {
        let matching: Vec<Arc<Job>> = {
            let mut registry = self.inner.shared.registry();
            let ids: Vec<RequestId> = registry
                .values()
                .filter(|job| job.tag() == Some(tag))
                .map(|job| job.id())
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        // 交付物的析构可能再次获取其他锁，必须在登记表锁之外取消
        let cancelled = matching.iter().filter(|job| job.cancel()).count();
        self.inner.shared.queue.purge_cancelled();

        if cancelled > 0 {
            log::info!("🧹 已取消标签 {} 下的 {} 个请求", tag, cancelled);
        }
        cancelled
    }

    /// 取消单个请求；请求不存在或已交付时返回 `false`。
    pub fn cancel(&self, id: RequestId) -> bool {
        let job = self.inner.shared.registry().get(&id).cloned();
        let Some(job) = job else {
            return false;
        };

        let cancelled = job.cancel();
        self.inner.shared.forget(&job);
        cancelled
    }

    /// 暂停出队；已在执行的请求不受影响。
    pub fn pause(&self) {
        self.inner.shared.queue.pause();
        log::info!("⏸️ 调度器已暂停");
    }

    pub fn resume(&self) {
        self.inner.shared.queue.resume();
        log::info!("▶️ 调度器已恢复");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.shared.queue.is_paused()
    }

    /// 尚未结束（排队中或执行中）的请求数。
    pub fn active(&self) -> usize {
        self.inner.shared.tracked()
    }

    /// 排队中（尚未开始执行）的请求数。
    pub fn pending(&self) -> usize {
        self.inner.shared.queue.len()
    }

    /// 响应缓存，可用于 `invalidate` / `remove` / `clear`。
    pub fn cache(&self) -> &ResponseCache {
        &self.inner.shared.cache
    }

    /// 停止工作线程并丢弃所有未交付的结果。可重复调用。
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        match self.inner.runtime.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .field("paused", &self.is_paused())
            .finish()
    }
}
