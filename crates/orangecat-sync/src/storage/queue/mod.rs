//! 离线写队列
//!
//! 按 owner 隔离的持久化 FIFO 队列。所有写操作串行执行，
//! 每次变更后发出 `offline_queue.queue_updated` 事件。
//!
//! 存储布局：
//! - `item:{hex(owner_id)}:{id}` → QueuedItem（JSON）
//! - `owner:{id}` → owner_id，按 id 定位记录

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventBus, SyncEvent};
use crate::storage::kv::{QueueBackend, WriteOp};

pub mod item;

pub use item::QueuedItem;

const ITEM_PREFIX: &str = "item:";
const OWNER_INDEX_PREFIX: &str = "owner:";

fn owner_prefix(owner_id: &str) -> Vec<u8> {
    format!("{}{}:", ITEM_PREFIX, hex::encode(owner_id)).into_bytes()
}

fn item_key(owner_id: &str, id: &str) -> Vec<u8> {
    let mut key = owner_prefix(owner_id);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_key(id: &str) -> Vec<u8> {
    format!("{}{}", OWNER_INDEX_PREFIX, id).into_bytes()
}

/// 一次前缀扫描的结果
struct OwnerScan {
    items: Vec<QueuedItem>,
    /// (原始键, ID)
    unreadable: Vec<(Vec<u8>, String)>,
}

/// 队列存储
#[derive(Debug)]
pub struct QueueStore {
    backend: Arc<dyn QueueBackend>,
    events: Arc<EventBus>,
    /// 写操作串行化，避免并发更新丢失
    write_lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn QueueBackend>, events: Arc<EventBus>) -> Self {
        Self {
            backend,
            events,
            write_lock: Mutex::new(()),
        }
    }

    fn validate_owner(owner_id: &str) -> Result<()> {
        if owner_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("owner_id must not be empty".to_string()));
        }
        Ok(())
    }

    fn serialize_item(item: &QueuedItem) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(item)?)
    }

    /// 入队一个写操作，返回新记录 ID
    ///
    /// 返回 Ok 时记录已经持久化，进程重启后仍然存在。
    pub async fn enqueue<P: Serialize + ?Sized>(&self, owner_id: &str, payload: &P) -> Result<String> {
        Self::validate_owner(owner_id)?;
        let payload = serde_json::to_value(payload)?;

        let (item, count) = {
            let _guard = self.write_lock.lock().await;
            let sequence = self.backend.next_sequence().await?;
            let mut item = QueuedItem::new(owner_id.to_string(), payload, sequence);
            let existing = self.scan(owner_id).await?;
            if let Some(last) = existing.items.iter().map(|i| i.created_at).max() {
                item.not_before(last);
            }

            self.backend
                .apply(vec![
                    WriteOp::Put {
                        key: item_key(owner_id, &item.id),
                        value: Self::serialize_item(&item)?,
                    },
                    WriteOp::Put {
                        key: index_key(&item.id),
                        value: owner_id.as_bytes().to_vec(),
                    },
                ])
                .await?;

            (item, existing.items.len() + 1)
        };

        info!(owner_id, item_id = %item.id, pending = count, "Queued offline write");
        self.emit_updated(owner_id, count).await;
        Ok(item.id)
    }

    async fn scan(&self, owner_id: &str) -> Result<OwnerScan> {
        let prefix = owner_prefix(owner_id);
        let entries = self.backend.scan_prefix(&prefix).await?;
        let mut scan = OwnerScan {
            items: Vec::with_capacity(entries.len()),
            unreadable: Vec::new(),
        };
        for (key, value) in entries {
            match serde_json::from_slice::<QueuedItem>(&value) {
                Ok(item) => scan.items.push(item),
                Err(e) => {
                    let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                    warn!(owner_id, item_id = %id, "Unreadable queue record: {}", e);
                    scan.unreadable.push((key, id));
                }
            }
        }
        scan.items.sort_by(|a, b| a.fifo_cmp(b));
        Ok(scan)
    }

    /// 列出 owner 的全部可读记录，按创建顺序升序
    ///
    /// 无法解析的记录不在结果中，由 `purge_unreadable` 清理。
    pub async fn list(&self, owner_id: &str) -> Result<Vec<QueuedItem>> {
        Ok(self.scan(owner_id).await?.items)
    }

    /// owner 的待处理数量，与 `list` 的长度一致
    pub async fn count(&self, owner_id: &str) -> Result<usize> {
        Ok(self.scan(owner_id).await?.items.len())
    }

    /// 删除 owner 下无法解析的记录，返回被删除的 ID
    pub async fn purge_unreadable(&self, owner_id: &str) -> Result<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let unreadable = self.scan(owner_id).await?.unreadable;
        if unreadable.is_empty() {
            return Ok(Vec::new());
        }
        let mut ops = Vec::with_capacity(unreadable.len() * 2);
        let mut ids = Vec::with_capacity(unreadable.len());
        for (key, id) in unreadable {
            ops.push(WriteOp::Delete { key });
            ops.push(WriteOp::Delete { key: index_key(&id) });
            ids.push(id);
        }
        self.backend.apply(ops).await?;
        warn!(owner_id, purged = ids.len(), "Purged unreadable queue records");
        Ok(ids)
    }

    /// 按 ID 获取记录
    pub async fn get(&self, id: &str) -> Result<Option<QueuedItem>> {
        let owner_id = match self.owner_of(id).await? {
            Some(owner_id) => owner_id,
            None => return Ok(None),
        };
        match self.backend.get(&item_key(&owner_id, id)).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn owner_of(&self, id: &str) -> Result<Option<String>> {
        match self.backend.get(&index_key(id)).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| SyncError::Serialization(format!("corrupted owner index for {}: {}", id, e))),
            None => Ok(None),
        }
    }

    /// 移除记录；ID 不存在时不做任何事，返回 false
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = {
            let _guard = self.write_lock.lock().await;
            match self.owner_of(id).await? {
                Some(owner_id) => {
                    self.backend
                        .apply(vec![
                            WriteOp::Delete {
                                key: item_key(&owner_id, id),
                            },
                            WriteOp::Delete { key: index_key(id) },
                        ])
                        .await?;
                    let count = self.count(&owner_id).await?;
                    Some((owner_id, count))
                }
                None => None,
            }
        };

        match removed {
            Some((owner_id, count)) => {
                debug!(owner_id = %owner_id, item_id = id, pending = count, "Removed queue record");
                self.emit_updated(&owner_id, count).await;
                Ok(true)
            }
            None => {
                debug!(item_id = id, "Remove of unknown queue record ignored");
                Ok(false)
            }
        }
    }

    /// 投递次数 +1 并记录投递时间，返回更新后的记录；记录不存在时返回 None
    pub async fn increment_attempt(&self, id: &str) -> Result<Option<QueuedItem>> {
        let updated = {
            let _guard = self.write_lock.lock().await;
            let mut item = match self.get(id).await? {
                Some(item) => item,
                None => return Ok(None),
            };
            item.record_attempt();
            self.backend
                .apply(vec![WriteOp::Put {
                    key: item_key(&item.owner_id, &item.id),
                    value: Self::serialize_item(&item)?,
                }])
                .await?;
            let count = self.count(&item.owner_id).await?;
            (item, count)
        };

        let (item, count) = updated;
        debug!(item_id = %item.id, attempt = item.attempt_count, "Recorded delivery attempt");
        self.emit_updated(&item.owner_id, count).await;
        Ok(Some(item))
    }

    /// 清空 owner 的全部记录（退出登录 / 测试重置），返回删除数量
    pub async fn clear(&self, owner_id: &str) -> Result<usize> {
        Self::validate_owner(owner_id)?;
        let removed = {
            let _guard = self.write_lock.lock().await;
            // 直接按键删除，损坏的记录也一并清理
            let prefix = owner_prefix(owner_id);
            let entries = self.backend.scan_prefix(&prefix).await?;
            if entries.is_empty() {
                return Ok(0);
            }
            let mut ops = Vec::with_capacity(entries.len() * 2);
            for (key, _) in &entries {
                let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                ops.push(WriteOp::Delete { key: key.clone() });
                ops.push(WriteOp::Delete { key: index_key(&id) });
            }
            self.backend.apply(ops).await?;
            entries.len()
        };

        info!(owner_id, removed, "Cleared offline queue");
        self.emit_updated(owner_id, 0).await;
        Ok(removed)
    }

    async fn emit_updated(&self, owner_id: &str, count: usize) {
        self.events
            .emit(SyncEvent::QueueUpdated {
                owner_id: owner_id.to_string(),
                count,
                timestamp: now_millis(),
            })
            .await;
    }
}
