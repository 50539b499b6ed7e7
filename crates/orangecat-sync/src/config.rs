//! 离线队列配置
//!
//! 所有参数都有默认值，可通过 [`SyncConfig::builder`] 覆盖，
//! 也可以直接从 JSON 反序列化（宿主应用的配置文件）。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::retry_policy::RetryPolicy;

/// 离线队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录（sled 数据库位于其下的 `queue/` 子目录）
    pub data_dir: PathBuf,
    /// 重试配置
    pub retry: RetryConfig,
    /// 单次远端写操作超时（秒），超时按网络错误处理
    pub attempt_timeout_secs: u64,
    /// 启动后首次自动同步前的宽限期（毫秒）
    pub startup_grace_ms: u64,
    /// 周期性兜底同步间隔（秒），None 表示关闭
    pub periodic_interval_secs: Option<u64>,
    /// 事件配置
    pub event_config: EventConfig,
    /// 调试模式（输出逐条 debug 日志）
    pub debug_mode: bool,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大投递次数（达到后按 exhausted 丢弃）
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件广播缓冲区大小
    pub buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            retry: RetryConfig::default(),
            attempt_timeout_secs: 30,
            startup_grace_ms: 3000,
            periodic_interval_secs: None,
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 300_000, // 5分钟
            jitter_factor: 0.1,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// 获取默认数据目录 ~/.orangecat/offline
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".orangecat").join("offline")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".orangecat").join("offline")
    } else {
        PathBuf::from("./orangecat_data")
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
        )
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs.map(Duration::from_secs)
    }

    /// sled 数据库目录
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if retry.base_delay_ms == 0 {
            return Err(SyncError::Config("retry.base_delay_ms must be positive".to_string()));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(SyncError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                retry.max_delay_ms, retry.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(SyncError::Config(format!(
                "retry.jitter_factor must be within [0, 1], got {}",
                retry.jitter_factor
            )));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(SyncError::Config("attempt_timeout_secs must be positive".to_string()));
        }
        if self.event_config.buffer_size == 0 {
            return Err(SyncError::Config("event_config.buffer_size must be positive".to_string()));
        }
        if self.periodic_interval_secs == Some(0) {
            return Err(SyncError::Config("periodic_interval_secs must be positive when set".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// 设置退避区间（毫秒）
    pub fn backoff_ms(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_delay_ms;
        self.config.retry.max_delay_ms = max_delay_ms;
        self
    }

    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.config.retry.jitter_factor = jitter_factor;
        self
    }

    pub fn attempt_timeout_secs(mut self, secs: u64) -> Self {
        self.config.attempt_timeout_secs = secs;
        self
    }

    pub fn startup_grace_ms(mut self, millis: u64) -> Self {
        self.config.startup_grace_ms = millis;
        self
    }

    pub fn periodic_interval_secs(mut self, secs: Option<u64>) -> Self {
        self.config.periodic_interval_secs = secs;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
