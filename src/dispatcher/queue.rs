//! # 优先级工作队列
//!
//! 二叉堆按“优先级降序、同级按入队序号升序”出队，保证同一优先级内先进先出。
//! 重试重新入队时拿到新的序号，排在同级已有请求之后。
//!
//! 工作线程通过 `Notify` 等待新任务；暂停时任务照常入队但不出队。

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use super::job::Job;
use crate::request::Priority;

struct QueuedJob {
    priority: Priority,
    seq: u64,
    attempt: u32,
    job: Arc<Job>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    next_seq: AtomicU64,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<QueuedJob>> {
        match self.heap.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("调度队列锁中毒，继续使用恢复数据");
                poisoned.into_inner()
            }
        }
    }

    /// 入队第 `attempt` 次尝试（从 1 开始）。
    pub(crate) fn push(&self, job: Arc<Job>, attempt: u32) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.lock().push(QueuedJob {
            priority: job.priority(),
            seq,
            attempt,
            job,
        });
        self.notify.notify_one();
    }

    /// 等待下一个可执行的任务；队列关闭后返回 `None`。
    pub(crate) async fn pop(&self) -> Option<(Arc<Job>, u32)> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            if !self.paused.load(Ordering::Acquire) {
                let next = self.lock().pop();
                if let Some(entry) = next {
                    if entry.job.is_cancelled() {
                        continue;
                    }
                    return Some((entry.job, entry.attempt));
                }
            }

            notified.await;
        }
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// 移除已取消的条目，返回移除数量。
    pub(crate) fn purge_cancelled(&self) -> usize {
        let mut heap = self.lock();
        let before = heap.len();
        heap.retain(|entry| !entry.job.is_cancelled());
        before - heap.len()
    }

    /// 尚未出队且未取消的条目数。
    pub(crate) fn len(&self) -> usize {
        self.lock().iter().filter(|entry| !entry.job.is_cancelled()).count()
    }

    /// 取出全部条目，供关闭时丢弃未执行的交付。
    pub(crate) fn drain(&self) -> Vec<Arc<Job>> {
        self.lock().drain().map(|entry| entry.job).collect()
    }
}
