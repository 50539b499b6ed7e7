use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 远端写失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 请求非法 / 被策略拒绝 - 不重试
    Client,
    /// 限流 - 延迟重试
    RateLimited,
    /// 服务端错误 - 延迟重试
    Server,
    /// 网络错误或超时 - 延迟重试，通常网络恢复后很快成功
    Network,
}

impl FailureKind {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Client => false,
            FailureKind::RateLimited => true,
            FailureKind::Server => true,
            FailureKind::Network => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Client => "client",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Server => "server",
            FailureKind::Network => "network",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 丢弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// 远端明确拒绝，立即丢弃
    Permanent,
    /// 重试次数耗尽
    Exhausted,
    /// 本地记录无法解析，无法投递
    Unreadable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Permanent => "permanent",
            DropReason::Exhausted => "exhausted",
            DropReason::Unreadable => "unreadable",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次失败之后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 停止本轮同步，延迟后重试
    RetryAfter(Duration),
    /// 从队列中移除
    Drop(DropReason),
}

/// 重试策略
///
/// 延迟 = base × 2^attempt_count，与服务端 retry-after 提示取较大值，
/// 再以 max_delay 封顶，最后叠加 `[0, jitter_factor × delay)` 的随机抖动。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大投递次数
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1000, 300_000, 0.1)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// 不含抖动的延迟，随 attempt_count 单调不减，封顶 max_delay
    pub fn base_delay_for_attempt(&self, attempt_count: u32, retry_after: Option<Duration>) -> Duration {
        let shift = attempt_count.min(32);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Duration::from_millis(calculated.max(hinted).min(self.max_delay_ms))
    }

    /// 含抖动的实际等待时间
    pub fn delay_for_attempt(&self, attempt_count: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.base_delay_for_attempt(attempt_count, retry_after);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let max_jitter = delay.as_millis() as f64 * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
        delay + Duration::from_millis(jitter as u64)
    }

    /// 是否已耗尽投递次数
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// 根据失败分类与（已递增的）投递次数决定下一步
    pub fn decide(
        &self,
        attempt_count: u32,
        kind: FailureKind,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::Drop(DropReason::Permanent);
        }
        if self.is_exhausted(attempt_count) {
            return RetryDecision::Drop(DropReason::Exhausted);
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempt_count, retry_after))
    }
}
