//! OrangeCat 离线写队列与同步引擎
//!
//! 断网时用户发起的写操作（发帖、评论等）先落盘排队，网络恢复后按顺序投递到远端：
//! - 📦 持久化：sled 存储，写入返回前已 flush，重启不丢
//! - 👤 账号隔离：只同步当前登录账号的记录
//! - 🔁 单飞同步：同一时刻只有一轮同步，严格 FIFO
//! - ⏱️ 指数退避 + 抖动，尊重服务端 retry-after
//! - 📡 网络恢复 / 回到前台自动触发
//! - 📣 事件广播：队列变化、同步进度、丢弃通知
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use orangecat_sync::{OfflineSync, RemoteWrite, SyncConfig, WriteFailure, WriteRequest};
//!
//! struct PostApi;
//!
//! #[async_trait]
//! impl RemoteWrite for PostApi {
//!     async fn execute(&self, request: &WriteRequest) -> Result<(), WriteFailure> {
//!         // 以 request.idempotency_key 作为去重键调用远端
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build();
//!
//!     let sync = OfflineSync::initialize(config, Arc::new(PostApi), None).await?;
//!     sync.sign_in("user123").await?;
//!
//!     let mut events = sync.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}: {:?}", event.event_type(), event);
//!         }
//!     });
//!
//!     sync.enqueue(&serde_json::json!({"action": "post", "body": "hello"})).await?;
//!     sync.sync_now().await?;
//!
//!     sync.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

pub use config::{EventConfig, RetryConfig, SyncConfig, SyncConfigBuilder};
pub use error::{Result, SyncError};
pub use events::{EventBus, EventFilter, EventListener, EventStats, FilteredEventReceiver, ListenerId, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{AppState, ConnectivityChange, ConnectivitySignal, NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use sdk::{DefaultNetworkStatusListener, OfflineSync};
pub use storage::{MemoryBackend, QueueBackend, QueueStore, QueuedItem, SledBackend};
pub use sync::{
    DrainHalt, DrainOutcome, DrainReport, DropReason, EngineSettings, FailureKind, RemoteWrite, RetryPolicy,
    SkipReason, SyncEngine, SyncPhase, TriggerSource, WriteFailure, WriteRequest,
};
pub use version::SDK_VERSION;
