//! KV 存储模块 - 离线队列的持久化后端
//!
//! 本模块提供：
//! - [`QueueBackend`]：队列存储对后端的最小要求（点查、前缀扫描、原子批量写、序号生成）
//! - [`SledBackend`]：基于 sled 的落盘实现，写入返回前已 flush
//! - [`MemoryBackend`]：纯内存实现，用于测试与无盘环境

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Result, SyncError};

/// 批量写操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// 队列持久化后端
#[async_trait]
pub trait QueueBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// 按键字典序返回指定前缀的全部键值对
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// 原子写入一批操作；返回 Ok 时数据必须已经持久化
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// 生成单调递增的序号（跨重启不回退）
    async fn next_sequence(&self) -> Result<u64>;
}

const QUEUE_TREE: &str = "offline_queue";

/// 基于 sled 的持久化后端
#[derive(Debug)]
pub struct SledBackend {
    path: PathBuf,
    db: Db,
    tree: Tree,
}

impl SledBackend {
    /// 打开（或创建）指定目录下的 sled 数据库
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();

        tokio::fs::create_dir_all(&path).await?;

        // 上一个实例可能刚释放文件锁（重启 / 切换账号），重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 50;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::debug!(attempt, delay_ms, "sled database locked, retrying open");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SyncError::Storage(
                last_err
                    .map(|e| format!("failed to open sled database: {}", e))
                    .unwrap_or_else(|| "failed to open sled database".to_string()),
            )
        })?;

        let tree = db.open_tree(QUEUE_TREE)?;
        tracing::info!("Offline queue store opened at {}", path.display());

        Ok(Self { path, db, tree })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueBackend for SledBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.insert(key, value),
                WriteOp::Delete { key } => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }
}

/// 内存后端
///
/// 可通过 [`MemoryBackend::set_unavailable`] 模拟存储介质故障。
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟磁盘已满 / 配额耗尽：之后的写操作全部失败
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("memory backend marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn next_sequence(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }
}
