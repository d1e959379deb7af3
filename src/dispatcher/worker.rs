//! # 工作线程执行流程
//!
//! 每个工作线程循环从队列取任务，按以下顺序处理一次尝试：
//!
//! 1. 已取消的任务直接丢弃。
//! 2. 首次尝试先查响应缓存：新鲜命中直接交付；陈旧命中先交付，再继续请求刷新缓存。
//! 3. 按重试策略计算本次超时，附带条件请求头执行传输。
//! 4. 失败时分类；可重试且未用尽次数则以 `attempt + 1` 重新入队，否则交付失败。
//! 5. 成功时写入缓存，再经解码策略交付。解码失败从不重试。
//!
//! 传输等待期间不持有任何锁。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::Shared;
use super::cache::CacheLookup;
use super::job::Job;
use crate::error::{RequestError, classify_status, classify_transport};
use crate::transport::{TransportRequest, redact_url_for_log};

const NOT_MODIFIED: u16 = 304;

pub(crate) async fn run(shared: Arc<Shared>, index: usize) {
    log::debug!("🧵 工作线程 {} 已启动", index);

    while let Some((job, attempt)) = shared.queue.pop().await {
        process(&shared, job, attempt).await;
    }

    log::debug!("🧵 工作线程 {} 已退出", index);
}

async fn process(shared: &Shared, job: Arc<Job>, attempt: u32) {
    if job.is_cancelled() {
        shared.retire(&job);
        return;
    }
    job.mark_executing();

    let mut request = match job.wire() {
        Ok(request) => request.clone(),
        Err(error) => {
            log::warn!("⚠️ 请求 {} 构建失败：{}", job.id(), error);
            job.finish(Err(error.clone()));
            shared.retire(&job);
            return;
        }
    };

    if job.should_cache() && attempt == 1 && job.is_awaiting_delivery() {
        match shared.cache.lookup(job.cache_key()) {
            CacheLookup::Fresh(body) => {
                log::debug!("💾 请求 {} 命中新鲜缓存", job.id());
                job.finish(Ok(body));
                shared.retire(&job);
                return;
            }
            CacheLookup::Stale(body) => {
                log::debug!("💾 请求 {} 命中陈旧缓存，先交付再刷新", job.id());
                job.finish(Ok(body));
            }
            CacheLookup::Miss => {}
        }
    }

    let validators = if job.should_cache() {
        shared.cache.validators(job.cache_key())
    } else {
        Vec::new()
    };
    let conditional = !validators.is_empty();
    request.headers.extend(validators);

    let timeout = job.policy().next_timeout(attempt);
    log::debug!(
        "🚀 执行请求 {} 第 {}/{} 次尝试 - {} {}（超时 {}ms）",
        job.id(),
        attempt,
        job.policy().max_attempts(),
        request.method.as_str(),
        redact_url_for_log(&request.url),
        timeout.as_millis()
    );

    let outcome = execute(shared, &job, request, timeout, conditional).await;

    if job.is_cancelled() {
        log::debug!("请求 {} 已在执行期间取消，结果丢弃", job.id());
        shared.retire(&job);
        return;
    }

    match outcome {
        Ok(body) => {
            if !job.finish(Ok(body)) {
                log::debug!("🔄 请求 {} 后台刷新完成", job.id());
            }
        }
        Err(error) => {
            if job.is_awaiting_delivery() && job.policy().should_retry(attempt, &error) {
                log::warn!(
                    "⚠️ 请求 {} 第 {} 次尝试失败（{}），重新入队",
                    job.id(),
                    attempt,
                    error
                );
                job.mark_queued();
                shared.queue.push(job, attempt + 1);
                return;
            }

            if job.finish(Err(error.clone())) {
                log::warn!("❌ 请求 {} 失败 [{}]：{}", job.id(), error.code(), error);
            } else {
                log::debug!("请求 {} 后台刷新失败：{}", job.id(), error);
            }
        }
    }

    shared.retire(&job);
}

async fn execute(
    shared: &Shared,
    job: &Job,
    request: TransportRequest,
    timeout: Duration,
    conditional: bool,
) -> Result<Bytes, RequestError> {
    let response = match tokio::time::timeout(timeout, shared.transport.execute(request, timeout)).await {
        Err(_) => return Err(RequestError::ResponseTimeout),
        Ok(Err(error)) => return Err(classify_transport(&error)),
        Ok(Ok(response)) => response,
    };

    if conditional && response.status == NOT_MODIFIED {
        log::debug!("请求 {} 返回 304，沿用缓存内容", job.id());
        return shared
            .cache
            .revalidated(job.cache_key(), &response)
            .ok_or_else(|| RequestError::TransportIo {
                message: "服务器返回 304，但本地缓存已失效".to_string(),
                transient: false,
            });
    }

    if let Some(error) = classify_status(response.status) {
        return Err(error);
    }

    if job.should_cache() {
        shared.cache.store(job.cache_key(), &response);
    }

    Ok(response.body)
}
