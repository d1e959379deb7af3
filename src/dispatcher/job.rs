//! # 请求任务与交付
//!
//! 调度队列只看得见类型擦除后的 `Job`：元数据、预先生成的传输请求、状态，
//! 以及一份“交付物”（解码策略 + 回调）。交付物只能被取走一次：
//! 要么由工作线程取走并完成交付，要么被取消时直接丢弃。两者在同一把锁下互斥，
//! 因此回调至多执行一次，取消后也绝不会再触发。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::Shared;
use crate::error::RequestError;
use crate::request::{DecodeStrategy, Priority, Request};
use crate::retry::RetryPolicy;
use crate::transport::TransportRequest;

/// 请求的唯一标识，进程内单调递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 请求生命周期：`Queued → Executing → {Succeeded, Failed, Cancelled}`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    Executing = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Executing,
            2 => Self::Succeeded,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

type Sink<T> = Box<dyn FnOnce(Result<T, RequestError>) + Send>;

/// 解码并交付一次结果，返回最终状态。
trait Delivery: Send {
    fn deliver(self: Box<Self>, outcome: Result<Bytes, RequestError>, state: &AtomicU8);
}

struct Decoded<D: DecodeStrategy> {
    decoder: D,
    sink: Sink<D::Output>,
}

impl<D: DecodeStrategy> Delivery for Decoded<D> {
    fn deliver(self: Box<Self>, outcome: Result<Bytes, RequestError>, state: &AtomicU8) {
        let Decoded { decoder, sink } = *self;
        let result = outcome.and_then(|body| decoder.decode(&body));

        let final_state = if result.is_ok() {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        };
        state.store(final_state as u8, Ordering::Release);
        sink(result);
    }
}

pub(crate) struct Job {
    id: RequestId,
    tag: Option<String>,
    priority: Priority,
    policy: RetryPolicy,
    should_cache: bool,
    cache_key: String,
    wire: Result<TransportRequest, RequestError>,
    state: AtomicU8,
    delivery: Mutex<Option<Box<dyn Delivery>>>,
}

impl Job {
    pub(crate) fn new<D: DecodeStrategy>(id: RequestId, request: Request<D>, sink: Sink<D::Output>) -> Self {
        let wire = request.to_transport_request();
        let cache_key = request.cache_key();
        let Request {
            priority,
            retry_policy,
            tag,
            should_cache,
            decoder,
            ..
        } = request;

        Self {
            id,
            tag,
            priority,
            policy: retry_policy,
            should_cache,
            cache_key,
            wire,
            state: AtomicU8::new(RequestState::Queued as u8),
            delivery: Mutex::new(Some(Box::new(Decoded { decoder, sink }))),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub(crate) fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub(crate) fn wire(&self) -> &Result<TransportRequest, RequestError> {
        &self.wire
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    /// 结果是否仍待交付。
    pub(crate) fn is_awaiting_delivery(&self) -> bool {
        self.lock_delivery().is_some()
    }

    pub(crate) fn mark_executing(&self) {
        let _ = self.state.compare_exchange(
            RequestState::Queued as u8,
            RequestState::Executing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// 重试重新入队时退回 `Queued`；已取消的请求保持不变。
    pub(crate) fn mark_queued(&self) {
        let _ = self.state.compare_exchange(
            RequestState::Executing as u8,
            RequestState::Queued as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn lock_delivery(&self) -> MutexGuard<'_, Option<Box<dyn Delivery>>> {
        match self.delivery.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("请求 {} 交付锁中毒，继续使用恢复数据", self.id);
                poisoned.into_inner()
            }
        }
    }

    /// 取消尚未交付的请求。已经交付（或已取消）时返回 `false`。
    pub(crate) fn cancel(&self) -> bool {
        let dropped = {
            let mut delivery = self.lock_delivery();
            let dropped = delivery.take();
            if dropped.is_some() {
                self.state.store(RequestState::Cancelled as u8, Ordering::Release);
            }
            dropped
        };
        dropped.is_some()
    }

    /// 交付终态结果；交付物已被取走时什么也不做。
    pub(crate) fn finish(&self, outcome: Result<Bytes, RequestError>) -> bool {
        let Some(delivery) = self.lock_delivery().take() else {
            return false;
        };
        delivery.deliver(outcome, &self.state);
        true
    }
}

/// `Dispatcher::submit` 返回的句柄，本身是一个 `Future`。
///
/// 丢弃句柄不会取消请求；需要取消时调用 `cancel`。
pub struct RequestHandle<T> {
    job: Arc<Job>,
    shared: Weak<Shared>,
    receiver: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(job: Arc<Job>, shared: Weak<Shared>, receiver: oneshot::Receiver<Result<T, RequestError>>) -> Self {
        Self { job, shared, receiver }
    }

    pub fn id(&self) -> RequestId {
        self.job.id()
    }

    pub fn state(&self) -> RequestState {
        self.job.state()
    }

    /// 取消请求，句柄随后解析为 `Err(Cancelled)`。
    pub fn cancel(&self) -> bool {
        let cancelled = self.job.cancel();
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(&self.job);
        }
        cancelled
    }

    /// 在普通线程上同步等待结果。
    ///
    /// 在异步运行时线程内调用会阻塞执行器，因此直接返回 `MainThreadViolation`。
    pub fn wait_blocking(self) -> Result<T, RequestError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            log::warn!("⚠️ 请求 {} 在异步运行时线程中被同步等待，已拒绝", self.job.id());
            return Err(RequestError::MainThreadViolation);
        }

        self.receiver
            .blocking_recv()
            .unwrap_or(Err(RequestError::Cancelled))
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Cancelled)))
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.job.id())
            .field("state", &self.job.state())
            .finish()
    }
}
