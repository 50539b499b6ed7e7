use thiserror::Error;

/// 离线队列错误
///
/// 只有环境级故障（存储介质不可用、配置错误等）才会以错误形式返回；
/// 单条写操作的远端失败属于业务结果，见 [`crate::sync::remote::WriteFailure`]。
#[derive(Debug, Error)]
pub enum SyncError {
    /// 参数非法（例如空的 owner_id）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// 持久化介质不可用（磁盘已满、sled 故障等）
    #[error("Storage unavailable: {0}")]
    Storage(String),
    /// 序列化 / 反序列化失败
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),
    /// 引擎已在运行
    #[error("Sync engine already running")]
    AlreadyRunning,
    /// 引擎未运行
    #[error("Sync engine not running")]
    NotRunning,
    /// 生命周期 Hook 执行失败
    #[error("Lifecycle hook failed: {0}")]
    Lifecycle(String),
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl SyncError {
    /// 是否为存储介质故障
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
