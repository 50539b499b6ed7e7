//! 存储模块 - 离线写队列的持久化层
//!
//! - `kv`：后端抽象与 sled / 内存实现
//! - `queue`：按 owner 隔离的 FIFO 队列

pub mod kv;
pub mod queue;

pub use kv::{MemoryBackend, QueueBackend, SledBackend, WriteOp};
pub use queue::{QueueStore, QueuedItem};
