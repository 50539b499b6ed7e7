use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 待投递的写操作
///
/// payload 的结构由入队方决定，本模块只负责保存与投递，入队后不再修改。
/// attempt_count / last_attempt_at 只由同步引擎通过 `QueueStore::increment_attempt` 更新。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    /// 入队时生成的唯一 ID
    pub id: String,
    /// 所属账号
    pub owner_id: String,
    /// 不透明的写命令
    pub payload: serde_json::Value,
    /// 远端去重用的幂等键，跨重试保持不变
    pub idempotency_key: String,
    /// 创建时间（UTC 毫秒），决定同一 owner 下的 FIFO 顺序
    pub created_at: i64,
    /// 存储内单调递增序号，同一毫秒内的二级排序键
    pub sequence: u64,
    /// 已投递次数
    pub attempt_count: u32,
    /// 最近一次投递时间（UTC 毫秒）
    pub last_attempt_at: Option<i64>,
}

impl QueuedItem {
    pub fn new(owner_id: String, payload: serde_json::Value, sequence: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            payload,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            sequence,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    /// 记录一次投递
    pub(crate) fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        let now = chrono::Utc::now().timestamp_millis();
        // 时钟回拨时保持 last_attempt_at 不早于创建时间
        self.last_attempt_at = Some(now.max(self.created_at));
    }

    /// 创建时间不早于 floor，时钟回拨时维持 FIFO
    pub(crate) fn not_before(&mut self, floor: i64) {
        self.created_at = self.created_at.max(floor);
    }

    /// FIFO 比较：先按创建时间，再按序号
    pub fn fifo_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.id.cmp(&other.id))
    }
}
