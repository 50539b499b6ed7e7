//! 离线写队列演示
//!
//! 断网时入队三条写操作，随后恢复网络，观察同步事件流。
//! 第二条记录第一次投递会收到 503，演示退避重试。
//!
//! 运行：`RUST_LOG=orangecat_sync=debug cargo run --example offline_demo`

use async_trait::async_trait;
use orangecat_sync::{
    NetworkStatus, NetworkStatusListener, OfflineSync, RemoteWrite, SyncConfig, SyncEvent, WriteFailure,
    WriteRequest,
};
use orangecat_sync::network::NetworkStatusEvent;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

/// 启动时离线的平台监听器，状态变化由 `set_network_status` 推送
#[derive(Debug)]
struct StartsOffline;

#[async_trait]
impl NetworkStatusListener for StartsOffline {
    async fn get_current_status(&self) -> NetworkStatus {
        NetworkStatus::Offline
    }

    async fn start_monitoring(&self) -> orangecat_sync::Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (_sender, receiver) = broadcast::channel(1);
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {}
}

/// 模拟远端：每个幂等键的第一次 "flaky" 请求返回 503
#[derive(Default)]
struct FlakyPostApi {
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl RemoteWrite for FlakyPostApi {
    async fn execute(&self, request: &WriteRequest) -> Result<(), WriteFailure> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_time = self.seen.lock().insert(request.idempotency_key.clone());
        if request.payload["flaky"].as_bool() == Some(true) && first_time {
            return Err(WriteFailure::from_status(503, "service unavailable"));
        }
        println!("  ✅ 远端已写入: {} (attempt {})", request.payload["body"], request.attempt);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("{}", orangecat_sync::version::version_string());

    let data_dir = std::env::temp_dir().join("orangecat_offline_demo");
    let config = SyncConfig::builder()
        .data_dir(&data_dir)
        .backoff_ms(200, 5_000)
        .startup_grace_ms(500)
        .debug_mode(true)
        .build();

    let sync = OfflineSync::initialize(config, Arc::new(FlakyPostApi::default()), Some(Arc::new(StartsOffline)))
        .await?;
    sync.sign_in("demo-user").await?;

    let mut events = sync.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                SyncEvent::SyncCompleted { remaining: 0, .. } => {
                    println!("📣 {} {:?}", event.event_type(), event);
                    break;
                }
                _ => println!("📣 {} {:?}", event.event_type(), event),
            }
        }
    });

    println!("=== 离线入队 ===");
    sync.enqueue(&json!({"body": "first post"})).await?;
    sync.enqueue(&json!({"body": "second post", "flaky": true})).await?;
    sync.enqueue(&json!({"body": "third post"})).await?;
    println!("待同步: {}", sync.pending_count().await?);

    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("=== 网络恢复 ===");
    sync.set_network_status(NetworkStatus::Online);

    if tokio::time::timeout(Duration::from_secs(10), printer).await.is_err() {
        println!("⚠️ 等待同步完成超时");
    }
    println!("待同步: {}", sync.pending_count().await?);

    sync.shutdown().await?;
    Ok(())
}
