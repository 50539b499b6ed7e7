//! 网络与前后台状态
//!
//! - [`NetworkStatusListener`]：平台层（Android/iOS/桌面）实现的网络监听
//! - [`NetworkMonitor`]：汇总网络状态与 App 前后台状态，实现 [`ConnectivitySignal`]
//! - [`ConnectivitySignal`]：同步引擎依赖的最小接口

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::now_millis;
use crate::lifecycle::LifecycleHook;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 受限网络也视为可用
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// App 前后台状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Foreground,
    Background,
}

/// 平台层上报的网络状态变化
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 对外广播的连接 / 生命周期变化
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityChange {
    Network {
        old: NetworkStatus,
        new: NetworkStatus,
        timestamp: u64,
    },
    App {
        old: AppState,
        new: AppState,
        timestamp: u64,
    },
}

impl ConnectivityChange {
    /// 离线 → 在线
    pub fn is_online_edge(&self) -> bool {
        matches!(self, ConnectivityChange::Network { old, new, .. } if !old.is_online() && new.is_online())
    }

    /// 后台 → 前台
    pub fn is_foreground_edge(&self) -> bool {
        matches!(
            self,
            ConnectivityChange::App {
                old: AppState::Background,
                new: AppState::Foreground,
                ..
            }
        )
    }
}

/// 网络状态监听器trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 同步引擎依赖的连接信号
pub trait ConnectivitySignal: Send + Sync + std::fmt::Debug {
    fn is_online(&self) -> bool;

    fn app_state(&self) -> AppState;

    /// 订阅网络与前后台变化
    fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange>;
}

#[derive(Debug)]
struct MonitorState {
    status: RwLock<NetworkStatus>,
    app_state: RwLock<AppState>,
    sender: broadcast::Sender<ConnectivityChange>,
}

impl MonitorState {
    fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.status.write();
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return;
        }
        info!("Network status changed: {:?} -> {:?}", old_status, new_status);
        let _ = self.sender.send(ConnectivityChange::Network {
            old: old_status,
            new: new_status,
            timestamp: now_millis(),
        });
    }

    fn set_app_state(&self, new_state: AppState) {
        let old_state = {
            let mut state = self.app_state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }
        info!("App state changed: {:?} -> {:?}", old_state, new_state);
        let _ = self.sender.send(ConnectivityChange::App {
            old: old_state,
            new: new_state,
            timestamp: now_millis(),
        });
    }
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    state: Arc<MonitorState>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (sender, _) = broadcast::channel(100);

        Self {
            listener,
            state: Arc::new(MonitorState {
                status: RwLock::new(NetworkStatus::Offline),
                app_state: RwLock::new(AppState::Foreground),
                sender,
            }),
            monitor_task: Mutex::new(None),
        }
    }

    /// 启动网络监控：读取平台当前状态并转发后续变化
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        self.state.set_status(initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => state.set_status(event.new_status),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Network monitor lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Network monitor task stopped");
        });

        if let Some(previous) = self.monitor_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止网络监控
    pub async fn stop(&self) {
        if let Some(handle) = self.monitor_task.lock().take() {
            handle.abort();
        }
        self.listener.stop_monitoring().await;
    }

    pub fn get_status(&self) -> NetworkStatus {
        *self.state.status.read()
    }

    /// 手动设置网络状态（平台回调直接推送时使用）
    pub fn set_status(&self, new_status: NetworkStatus) {
        self.state.set_status(new_status);
    }

    pub fn set_app_state(&self, new_state: AppState) {
        self.state.set_app_state(new_state);
    }
}

impl ConnectivitySignal for NetworkMonitor {
    fn is_online(&self) -> bool {
        self.get_status().is_online()
    }

    fn app_state(&self) -> AppState {
        *self.state.app_state.read()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.state.sender.subscribe()
    }
}

#[async_trait]
impl LifecycleHook for NetworkMonitor {
    async fn on_background(&self) -> Result<()> {
        self.set_app_state(AppState::Background);
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.set_app_state(AppState::Foreground);
        Ok(())
    }
}


#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
