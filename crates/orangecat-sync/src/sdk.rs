//! 离线同步统一入口 - OfflineSync
//!
//! ```text
//! OfflineSync
//!   ├── QueueStore   (sled 持久化队列)
//!   ├── SyncEngine   (同步状态机)
//!   ├── EventBus     (事件广播)
//!   ├── NetworkMonitor + LifecycleManager
//!   └── RemoteWrite  (宿主注入)
//! ```

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::lifecycle::{LifecycleHook, LifecycleManager};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
use crate::storage::kv::SledBackend;
use crate::storage::queue::{QueueStore, QueuedItem};
use crate::sync::engine::{DrainOutcome, EngineSettings, SyncEngine};
use crate::sync::phase::TriggerSource;
use crate::sync::remote::RemoteWrite;

/// 默认网络状态监听器（假设网络始终在线）
///
/// 实际应用应由平台层提供真实的网络状态监听，或通过
/// [`OfflineSync::set_network_status`] 手动推送。
#[derive(Debug, Default)]
pub struct DefaultNetworkStatusListener;

#[async_trait::async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        // 不会有变化上报；sender 随之释放，监控任务收到 Closed 后退出
        let (_sender, receiver) = broadcast::channel(1);
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {}
}

/// 离线同步入口
pub struct OfflineSync {
    config: SyncConfig,
    events: Arc<EventBus>,
    store: Arc<QueueStore>,
    monitor: Arc<NetworkMonitor>,
    engine: SyncEngine,
    lifecycle_manager: RwLock<LifecycleManager>,
    initialized: RwLock<bool>,
}

impl std::fmt::Debug for OfflineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSync")
            .field("data_dir", &self.config.data_dir)
            .field("engine", &self.engine)
            .finish()
    }
}

impl OfflineSync {
    /// 初始化：打开存储 → 启动网络监控 → 启动同步引擎
    ///
    /// `listener` 为 None 时使用 [`DefaultNetworkStatusListener`]。
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteWrite>,
        listener: Option<Arc<dyn NetworkStatusListener>>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 OfflineSync...");
        config.validate()?;

        // === 第1层：存储 ===
        let events = Arc::new(EventBus::new(config.event_config.buffer_size));
        let backend = Arc::new(SledBackend::open(&config.queue_dir()).await?);
        let store = Arc::new(QueueStore::new(backend, events.clone()));

        // === 第2层：网络监控 ===
        let listener: Arc<dyn NetworkStatusListener> = match listener {
            Some(listener) => listener,
            None => Arc::new(DefaultNetworkStatusListener),
        };
        let monitor = Arc::new(NetworkMonitor::new(listener));
        monitor.start().await?;

        // === 第3层：同步引擎 ===
        let engine = SyncEngine::new(
            EngineSettings::from_config(&config),
            store.clone(),
            remote,
            monitor.clone(),
            events.clone(),
        );

        // === 第4层：生命周期 ===
        let mut lifecycle_manager = LifecycleManager::new();
        lifecycle_manager.register_hook(monitor.clone());

        engine.start()?;

        info!(
            version = crate::version::SDK_VERSION,
            git_sha = crate::version::GIT_SHA,
            "OfflineSync 初始化完成"
        );

        Ok(Arc::new(Self {
            config,
            events,
            store,
            monitor,
            engine,
            lifecycle_manager: RwLock::new(lifecycle_manager),
            initialized: RwLock::new(true),
        }))
    }

    async fn check_initialized(&self) -> Result<()> {
        if !*self.initialized.read().await {
            return Err(SyncError::NotRunning);
        }
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    fn require_owner(&self) -> Result<String> {
        self.engine
            .current_owner()
            .ok_or_else(|| SyncError::InvalidArgument("no signed-in owner".to_string()))
    }

    /// 以当前账号入队一个写操作，返回记录 ID
    ///
    /// 返回 Ok 即表示已落盘，界面可以立即显示为"已排队"。
    pub async fn enqueue<P: Serialize + ?Sized>(&self, payload: &P) -> Result<String> {
        self.check_initialized().await?;
        let owner_id = self.require_owner()?;
        self.store.enqueue(&owner_id, payload).await
    }

    /// 当前账号的待处理记录（按创建顺序）
    pub async fn pending(&self) -> Result<Vec<QueuedItem>> {
        match self.engine.current_owner() {
            Some(owner_id) => self.store.list(&owner_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn pending_count(&self) -> Result<usize> {
        match self.engine.current_owner() {
            Some(owner_id) => self.store.count(&owner_id).await,
            None => Ok(0),
        }
    }

    /// 登录 / 切换账号，之后只同步该账号的记录
    pub async fn sign_in(&self, owner_id: &str) -> Result<()> {
        self.check_initialized().await?;
        if owner_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("owner_id must not be empty".to_string()));
        }
        self.engine.set_owner(Some(owner_id.to_string())).await;
        Ok(())
    }

    /// 退出登录；`clear_pending` 为 true 时同时删除该账号未同步的记录，返回删除数量
    pub async fn sign_out(&self, clear_pending: bool) -> Result<usize> {
        self.check_initialized().await?;
        let previous = self.engine.current_owner();
        self.engine.set_owner(None).await;

        match previous {
            Some(owner_id) if clear_pending => {
                let removed = self.store.clear(&owner_id).await?;
                if removed > 0 {
                    warn!(owner_id = %owner_id, removed, "Discarded unsynced writes on sign-out");
                }
                Ok(removed)
            }
            _ => Ok(0),
        }
    }

    /// App 切换到前台
    pub async fn on_foreground(&self) -> Result<()> {
        self.check_initialized().await?;
        info!("🔄 App 切换到前台");
        self.lifecycle_manager.read().await.notify_foreground().await
    }

    /// App 切换到后台
    pub async fn on_background(&self) -> Result<()> {
        self.check_initialized().await?;
        info!("🔄 App 切换到后台");
        self.lifecycle_manager.read().await.notify_background().await
    }

    /// 注册生命周期回调 Hook
    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn LifecycleHook>) -> Result<()> {
        self.check_initialized().await?;
        self.lifecycle_manager.write().await.register_hook(hook);
        Ok(())
    }

    /// 平台层直接推送网络状态
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.monitor.set_status(status);
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.get_status()
    }

    /// 手动同步一轮
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.check_initialized().await?;
        self.engine.sync_now(TriggerSource::Manual).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 关闭：停止引擎与网络监控；已入队的记录保留在磁盘上
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut initialized = self.initialized.write().await;
            if !*initialized {
                return Ok(());
            }
            *initialized = false;
        }
        info!("正在关闭 OfflineSync...");

        match self.engine.stop().await {
            Ok(()) | Err(SyncError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.monitor.stop().await;

        info!("OfflineSync 关闭完成");
        Ok(())
    }
}
