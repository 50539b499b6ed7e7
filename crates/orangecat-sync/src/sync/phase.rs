//! 同步引擎阶段状态机
//!
//! ```text
//! Idle ──trigger──▶ Triggered ──begin_drain──▶ Draining ──finish──▶ Idle
//!  ▲                   │                          │
//!  │                   └──────finish──────────────┤
//!  │                                              ▼
//!  └────────reset────── BackoffWait ◀──enter_backoff
//!                           │
//!                           └──trigger──▶ Triggered
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{now_millis, SyncEvent};

/// 引擎阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Triggered,
    Draining,
    BackoffWait,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Triggered => "triggered",
            SyncPhase::Draining => "draining",
            SyncPhase::BackoffWait => "backoff_wait",
        }
    }
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// 离线 → 在线
    ConnectivityRegained,
    /// 后台 → 前台
    Foregrounded,
    /// 启动宽限期结束
    Startup,
    /// 退避计时器到期
    BackoffExpired,
    /// 周期兜底
    Periodic,
    /// 宿主主动调用
    Manual,
}

impl TriggerSource {
    /// 外部触发会取消尚未到期的退避计时器
    pub fn cancels_backoff(&self) -> bool {
        matches!(
            self,
            TriggerSource::ConnectivityRegained
                | TriggerSource::Foregrounded
                | TriggerSource::Startup
                | TriggerSource::Manual
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::ConnectivityRegained => "connectivity_regained",
            TriggerSource::Foregrounded => "foregrounded",
            TriggerSource::Startup => "startup",
            TriggerSource::BackoffExpired => "backoff_expired",
            TriggerSource::Periodic => "periodic",
            TriggerSource::Manual => "manual",
        }
    }
}

/// 非法的阶段切换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition from {from:?} on {action}")]
pub struct InvalidTransition {
    pub from: SyncPhase,
    pub action: &'static str,
}

/// 一次成功的阶段切换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: SyncPhase,
    pub to: SyncPhase,
}

impl PhaseTransition {
    pub fn into_event(self) -> SyncEvent {
        SyncEvent::PhaseChanged {
            from: self.from,
            to: self.to,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: SyncPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
        }
    }
}

impl PhaseMachine {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// 单飞检查：已在 Triggered / Draining 时拒绝
    pub fn trigger(&mut self) -> Result<PhaseTransition, InvalidTransition> {
        self.transition_from_any_of(
            &[SyncPhase::Idle, SyncPhase::BackoffWait],
            SyncPhase::Triggered,
            "trigger",
        )
    }

    pub fn begin_drain(&mut self) -> Result<PhaseTransition, InvalidTransition> {
        self.transition_from_any_of(&[SyncPhase::Triggered], SyncPhase::Draining, "begin_drain")
    }

    pub fn enter_backoff(&mut self) -> Result<PhaseTransition, InvalidTransition> {
        self.transition_from_any_of(&[SyncPhase::Draining], SyncPhase::BackoffWait, "enter_backoff")
    }

    /// 一轮同步结束（或在 Triggered 阶段被放弃）
    pub fn finish(&mut self) -> Option<PhaseTransition> {
        self.transition_from_any_of(
            &[SyncPhase::Triggered, SyncPhase::Draining],
            SyncPhase::Idle,
            "finish",
        )
        .ok()
    }

    /// 放弃等待中的退避（切换账号 / 停止引擎）
    pub fn reset(&mut self) -> Option<PhaseTransition> {
        self.transition_from_any_of(&[SyncPhase::BackoffWait], SyncPhase::Idle, "reset")
            .ok()
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SyncPhase],
        next: SyncPhase,
        action: &'static str,
    ) -> Result<PhaseTransition, InvalidTransition> {
        if !expected.contains(&self.phase) {
            return Err(InvalidTransition {
                from: self.phase,
                action,
            });
        }
        let transition = PhaseTransition {
            from: self.phase,
            to: next,
        };
        self.phase = next;
        Ok(transition)
    }
}
