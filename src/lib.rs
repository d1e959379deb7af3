//! # netqueue — 异步网络请求核心
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     调用方（界面 / 服务）                 │
//! │                                                          │
//! │   Request<D> ──submit──▶ RequestHandle (Future)          │
//! │        │      submit_with ──▶ 成功 / 失败回调            │
//! │   ImageLoader ── ImageSlot                               │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↕
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕             netqueue                             │
//! │                                                          │
//! │  ┌─ dispatcher ── 优先级队列 + 工作线程 + 响应缓存       │
//! │  │    └─ retry     超时退避 / 可重试分类                 │
//! │  │                                                       │
//! │  ├─ request ───── 方法·参数·解码策略（文本/JSON/XML…）   │
//! │  ├─ envelope ──── {error_code, reason, result} 信封      │
//! │  ├─ transport ─── Transport trait + reqwest 实现         │
//! │  ├─ image ─────── 解码·降采样·字节有界 LRU·去重加载      │
//! │  └─ error ─────── RequestError (封闭分类) / ConfigError  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 请求失败分类 `RequestError` 与配置错误 `ConfigError` |
//! | [`config`] | 调度器与 HTTP 传输层配置，支持 JSON 加载 |
//! | [`retry`] | 单次超时、最大尝试次数、退避倍数 |
//! | [`envelope`] | 后端返回信封的规整与类型化载荷解码 |
//! | [`request`] | 类型化请求、参数编码、解码策略、XML 事件流 |
//! | [`transport`] | 传输层抽象与基于 `reqwest` 的默认实现 |
//! | [`dispatcher`] | 优先级调度、重试、取消、暂停恢复、响应缓存 |
//! | [`image`] | 图片解码降采样、有界缓存、去重加载、自动尺寸槽位 |

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod image;
pub mod request;
pub mod retry;
pub mod transport;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, RequestHandle, RequestId, RequestState};
pub use envelope::ResultEnvelope;
pub use error::{ConfigError, RequestError};
pub use request::{Method, Priority, Request};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest, TransportResponse};
