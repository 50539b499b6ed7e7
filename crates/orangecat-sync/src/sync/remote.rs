//! 远端写操作（由宿主注入）
//!
//! 引擎只把它当作黑盒：成功即删除，失败按 [`FailureKind`] 分类处理。
//! 投递语义为 at-least-once，实现方应以 `idempotency_key` 去重。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::storage::queue::QueuedItem;
use crate::sync::retry_policy::FailureKind;

/// 一次写请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub item_id: String,
    pub owner_id: String,
    /// 入队时生成，跨重试保持不变，远端据此去重
    pub idempotency_key: String,
    /// 本次是第几次投递（从 1 开始）
    pub attempt: u32,
    pub payload: serde_json::Value,
}

impl WriteRequest {
    pub fn from_item(item: &QueuedItem) -> Self {
        Self {
            item_id: item.id.clone(),
            owner_id: item.owner_id.clone(),
            idempotency_key: item.idempotency_key.clone(),
            attempt: item.attempt_count + 1,
            payload: item.payload.clone(),
        }
    }
}

/// 远端写失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub kind: FailureKind,
    pub message: String,
    /// 服务端给出的重试提示（限流时常见）
    pub retry_after: Option<Duration>,
}

impl WriteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Client, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Server, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: "rate limited".to_string(),
            retry_after,
        }
    }

    /// 按 HTTP 状态码分类：429 限流，408 网络，425 与 5xx 服务端，其余 4xx 客户端错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => FailureKind::RateLimited,
            408 => FailureKind::Network,
            425 => FailureKind::Server,
            400..=499 => FailureKind::Client,
            500..=599 => FailureKind::Server,
            // 非错误状态码被当作失败上报，视为远端异常，保留重试
            100..=399 => FailureKind::Server,
            _ => FailureKind::Server,
        };
        Self::new(kind, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// 远端写操作
#[async_trait]
pub trait RemoteWrite: Send + Sync {
    async fn execute(&self, request: &WriteRequest) -> std::result::Result<(), WriteFailure>;
}
