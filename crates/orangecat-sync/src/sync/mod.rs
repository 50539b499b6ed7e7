//! 离线队列同步
//!
//! - `engine`：单飞的同步状态机
//! - `phase`：阶段与触发来源
//! - `remote`：宿主注入的远端写操作
//! - `retry_policy`：失败分类与退避

pub mod engine;
pub mod phase;
pub mod remote;
pub mod retry_policy;

pub use engine::{DrainHalt, DrainOutcome, DrainReport, EngineSettings, SkipReason, SyncEngine};
pub use phase::{InvalidTransition, PhaseMachine, PhaseTransition, SyncPhase, TriggerSource};
pub use remote::{RemoteWrite, WriteFailure, WriteRequest};
pub use retry_policy::{DropReason, FailureKind, RetryDecision, RetryPolicy};
