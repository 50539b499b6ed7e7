//! 离线队列同步引擎
//!
//! 负责把当前 owner 的待处理写操作按 FIFO 顺序投递到远端：
//! - 同一时刻只有一轮同步在执行（单飞），重复触发直接跳过
//! - 成功即删除；不可重试的失败立即丢弃；可重试的失败停在当前记录并进入退避
//! - 退避计时器到期，或外部触发（网络恢复 / 回到前台 / 手动）到来时重新同步
//! - 同步过程中切换账号会放弃本轮，未处理的记录原样保留
//!
//! 单条记录的失败不会以错误形式返回，只通过事件与 [`DrainReport`] 体现；
//! 只有存储本身不可用时 `sync_now` 才返回 `Err`。

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventBus, SyncEvent};
use crate::network::{ConnectivityChange, ConnectivitySignal};
use crate::storage::queue::{QueueStore, QueuedItem};
use crate::sync::phase::{PhaseMachine, PhaseTransition, SyncPhase, TriggerSource};
use crate::sync::remote::{RemoteWrite, WriteFailure, WriteRequest};
use crate::sync::retry_policy::{DropReason, RetryDecision, RetryPolicy};

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: RetryPolicy,
    /// 单次远端调用超时
    pub attempt_timeout: Duration,
    /// `start()` 之后首次自动同步的等待时间
    pub startup_grace: Duration,
    /// 周期兜底触发间隔
    pub periodic_interval: Option<Duration>,
    /// 输出逐条 debug 日志
    pub verbose: bool,
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            policy: config.retry.to_policy(),
            attempt_timeout: config.attempt_timeout(),
            startup_grace: config.startup_grace(),
            periodic_interval: config.periodic_interval(),
            verbose: config.debug_mode,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// 触发被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 已有一轮同步在执行
    AlreadyDraining,
    /// 未设置当前 owner
    NoOwner,
    /// 当前离线
    Offline,
    /// 退避未到期，且触发来源不能打断退避
    BackoffPending,
    /// 退避计时器到期时退避已被取消或已被其它触发接管
    Superseded,
}

/// 一轮同步的结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainHalt {
    /// 队列已清空
    Emptied,
    /// 遇到可重试失败，停在该记录
    Backoff {
        item_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// 同步过程中 owner 发生变化
    OwnerChanged,
}

/// 一轮同步的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub owner_id: String,
    /// 本轮读取到的记录数
    pub total: usize,
    pub succeeded: usize,
    pub dropped: usize,
    /// 结束时该 owner 仍待处理的数量
    pub remaining: usize,
    pub halt: DrainHalt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Finished(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Finished(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            DrainOutcome::Skipped(reason) => Some(*reason),
            DrainOutcome::Finished(_) => None,
        }
    }
}

enum FailureOutcome {
    Dropped,
    /// 记录在处理过程中已被移除（例如退出登录时清空）
    Vanished,
    Halt(DrainHalt),
}

struct EngineInner {
    settings: EngineSettings,
    store: Arc<QueueStore>,
    remote: Arc<dyn RemoteWrite>,
    connectivity: Arc<dyn ConnectivitySignal>,
    events: Arc<EventBus>,
    owner: RwLock<Option<String>>,
    /// owner 每变化一次 +1，同步过程中据此判断是否需要放弃
    epoch: AtomicU64,
    machine: Mutex<PhaseMachine>,
    backoff_timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

/// 同步引擎
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &*self.inner.owner.read())
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<QueueStore>,
        remote: Arc<dyn RemoteWrite>,
        connectivity: Arc<dyn ConnectivitySignal>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                store,
                remote,
                connectivity,
                events,
                owner: RwLock::new(None),
                epoch: AtomicU64::new(0),
                machine: Mutex::new(PhaseMachine::default()),
                backoff_timer: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.machine.lock().phase()
    }

    pub fn current_owner(&self) -> Option<String> {
        self.inner.owner.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.shutdown.lock().is_some()
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn owner_snapshot(&self) -> (Option<String>, u64) {
        let owner = self.inner.owner.read();
        (owner.clone(), self.epoch())
    }

    /// 设置当前 owner（登录 / 切换账号 / 退出登录）
    ///
    /// 进行中的同步会在当前远端调用返回后放弃；等待中的退避被取消。
    /// 引擎运行中且新 owner 非空时立即触发一轮同步。
    pub async fn set_owner(&self, owner_id: Option<String>) {
        let transition = {
            let mut machine = self.inner.machine.lock();
            let mut owner = self.inner.owner.write();
            if *owner == owner_id {
                return;
            }
            *owner = owner_id.clone();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            machine.reset()
        };
        self.cancel_backoff_timer();
        if let Some(transition) = transition {
            self.emit_transition(transition).await;
        }
        info!(owner_id = ?owner_id, "Offline queue owner changed");

        if owner_id.is_some() && self.is_running() {
            self.trigger(TriggerSource::Manual);
        }
    }

    /// 立即尝试一轮同步
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_now(&self, source: TriggerSource) -> Result<DrainOutcome> {
        let (owner_id, epoch) = match self.begin(source).await {
            Ok(started) => started,
            Err(reason) => {
                debug!(source = source.as_str(), ?reason, "Offline queue trigger skipped");
                return Ok(DrainOutcome::Skipped(reason));
            }
        };

        let result = self.drain(&owner_id, epoch, source).await;
        self.finish(epoch, &result).await;

        let report = result?;
        if report.halt == DrainHalt::OwnerChanged && self.is_running() && self.current_owner().is_some() {
            self.trigger(TriggerSource::Manual);
        }
        Ok(DrainOutcome::Finished(report))
    }

    /// 异步触发一轮同步，不等待结果
    pub fn trigger(&self, source: TriggerSource) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_triggered(source).await })
    }

    async fn run_triggered(&self, source: TriggerSource) {
        match self.sync_now(source).await {
            Ok(DrainOutcome::Skipped(_)) => {}
            Ok(DrainOutcome::Finished(report)) => {
                debug!(
                    owner_id = %report.owner_id,
                    succeeded = report.succeeded,
                    dropped = report.dropped,
                    remaining = report.remaining,
                    "Triggered drain finished"
                );
            }
            Err(e) => {
                error!(source = source.as_str(), "Offline queue drain failed: {}", e);
            }
        }
    }

    /// 启动事件循环：网络恢复、回到前台、启动宽限期与周期兜底都会触发同步
    pub fn start(&self) -> Result<()> {
        let token = {
            let mut shutdown = self.inner.shutdown.lock();
            if shutdown.is_some() {
                return Err(SyncError::AlreadyRunning);
            }
            let token = CancellationToken::new();
            *shutdown = Some(token.clone());
            token
        };

        let changes = self.inner.connectivity.subscribe();
        let settings = &self.inner.settings;
        tokio::spawn(run_event_loop(
            Arc::downgrade(&self.inner),
            changes,
            token,
            settings.startup_grace,
            settings.periodic_interval,
        ));

        info!(
            startup_grace_ms = settings.startup_grace.as_millis() as u64,
            periodic = ?settings.periodic_interval,
            "Offline sync engine started"
        );
        Ok(())
    }

    /// 停止事件循环并取消等待中的退避；进行中的同步会自然结束
    pub async fn stop(&self) -> Result<()> {
        let token = self.inner.shutdown.lock().take().ok_or(SyncError::NotRunning)?;
        token.cancel();
        self.cancel_backoff_timer();

        let transition = self.inner.machine.lock().reset();
        if let Some(transition) = transition {
            self.emit_transition(transition).await;
        }
        info!("Offline sync engine stopped");
        Ok(())
    }

    async fn begin(&self, source: TriggerSource) -> std::result::Result<(String, u64), SkipReason> {
        let (owner_id, epoch) = self.owner_snapshot();
        let owner_id = owner_id.ok_or(SkipReason::NoOwner)?;
        if !self.inner.connectivity.is_online() {
            return Err(SkipReason::Offline);
        }

        let transitions = {
            let mut machine = self.inner.machine.lock();
            match machine.phase() {
                SyncPhase::Triggered | SyncPhase::Draining => return Err(SkipReason::AlreadyDraining),
                SyncPhase::BackoffWait
                    if !source.cancels_backoff() && source != TriggerSource::BackoffExpired =>
                {
                    return Err(SkipReason::BackoffPending)
                }
                SyncPhase::Idle if source == TriggerSource::BackoffExpired => return Err(SkipReason::Superseded),
                _ => {}
            }
            let triggered = machine.trigger().map_err(|_| SkipReason::AlreadyDraining)?;
            let draining = machine.begin_drain().map_err(|_| SkipReason::AlreadyDraining)?;
            [triggered, draining]
        };

        // 计时器任务到期后只派生触发，不执行同步，abort 不会打断进行中的同步
        if let Some(timer) = self.inner.backoff_timer.lock().take() {
            if source != TriggerSource::BackoffExpired {
                debug!(source = source.as_str(), "Pending backoff cancelled by external trigger");
            }
            timer.abort();
        }

        for transition in transitions {
            self.emit_transition(transition).await;
        }
        Ok((owner_id, epoch))
    }

    async fn drain(&self, owner_id: &str, epoch: u64, source: TriggerSource) -> Result<DrainReport> {
        let unreadable = self.inner.store.purge_unreadable(owner_id).await?;
        let mut items = self.inner.store.list(owner_id).await?;
        let mut report = DrainReport {
            owner_id: owner_id.to_string(),
            total: items.len() + unreadable.len(),
            succeeded: 0,
            dropped: 0,
            remaining: 0,
            halt: DrainHalt::Emptied,
        };

        info!(owner_id, total = report.total, source = source.as_str(), "Offline queue drain started");
        self.emit(SyncEvent::SyncStarted {
            owner_id: owner_id.to_string(),
            total: report.total,
            source,
            timestamp: now_millis(),
        })
        .await;
        self.report_unreadable(&mut report, unreadable).await;

        'drain: while !items.is_empty() {
            for item in items {
                if self.epoch() != epoch {
                    report.halt = DrainHalt::OwnerChanged;
                    break 'drain;
                }

                let outcome = self.attempt(&item).await;

                if self.epoch() != epoch {
                    warn!(owner_id, item_id = %item.id, "Owner changed during remote write, result ignored");
                    report.halt = DrainHalt::OwnerChanged;
                    break 'drain;
                }

                match outcome {
                    Ok(()) => {
                        self.inner.store.remove(&item.id).await?;
                        report.succeeded += 1;
                        self.emit_progress(&report, &item.id).await;
                    }
                    Err(failure) => match self.handle_failure(&item, failure).await? {
                        FailureOutcome::Dropped => {
                            report.dropped += 1;
                            self.emit_progress(&report, &item.id).await;
                        }
                        FailureOutcome::Vanished => {}
                        FailureOutcome::Halt(halt) => {
                            report.halt = halt;
                            break 'drain;
                        }
                    },
                }

                tokio::task::yield_now().await;
            }

            // 同步期间新入队的记录在同一轮内继续处理
            let unreadable = self.inner.store.purge_unreadable(owner_id).await?;
            items = self.inner.store.list(owner_id).await?;
            report.total += items.len() + unreadable.len();
            self.report_unreadable(&mut report, unreadable).await;
        }

        report.remaining = self.inner.store.count(owner_id).await?;
        info!(
            owner_id,
            succeeded = report.succeeded,
            dropped = report.dropped,
            remaining = report.remaining,
            halt = ?report.halt,
            "Offline queue drain finished"
        );
        self.emit(SyncEvent::SyncCompleted {
            owner_id: owner_id.to_string(),
            succeeded: report.succeeded,
            dropped: report.dropped,
            remaining: report.remaining,
            timestamp: now_millis(),
        })
        .await;
        Ok(report)
    }

    /// 已从存储删除的损坏记录按丢弃上报
    async fn report_unreadable(&self, report: &mut DrainReport, item_ids: Vec<String>) {
        for item_id in item_ids {
            let failure = WriteFailure::client("queued record could not be decoded");
            self.emit_dropped(&report.owner_id, &item_id, DropReason::Unreadable, &failure, 0)
                .await;
            report.dropped += 1;
            self.emit_progress(report, &item_id).await;
        }
    }

    /// 单次远端调用，超时按网络错误处理
    async fn attempt(&self, item: &QueuedItem) -> std::result::Result<(), WriteFailure> {
        let request = WriteRequest::from_item(item);
        let timeout = self.inner.settings.attempt_timeout;
        if self.inner.settings.verbose {
            debug!(item_id = %request.item_id, attempt = request.attempt, "Delivering queued write");
        }

        match tokio::time::timeout(timeout, self.inner.remote.execute(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WriteFailure::network(format!(
                "remote write timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn handle_failure(&self, item: &QueuedItem, failure: WriteFailure) -> Result<FailureOutcome> {
        if !failure.is_retryable() {
            if self.inner.store.remove(&item.id).await? {
                self.emit_dropped(&item.owner_id, &item.id, DropReason::Permanent, &failure, item.attempt_count + 1)
                    .await;
                return Ok(FailureOutcome::Dropped);
            }
            return Ok(FailureOutcome::Vanished);
        }

        let updated = match self.inner.store.increment_attempt(&item.id).await? {
            Some(updated) => updated,
            None => return Ok(FailureOutcome::Vanished),
        };

        match self
            .inner
            .settings
            .policy
            .decide(updated.attempt_count, failure.kind, failure.retry_after)
        {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    owner_id = %updated.owner_id,
                    item_id = %updated.id,
                    attempt = updated.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "Queued write failed, backing off: {}",
                    failure
                );
                self.emit(SyncEvent::RetryScheduled {
                    owner_id: updated.owner_id.clone(),
                    item_id: updated.id.clone(),
                    attempt: updated.attempt_count,
                    delay_ms: delay.as_millis() as u64,
                    timestamp: now_millis(),
                })
                .await;
                Ok(FailureOutcome::Halt(DrainHalt::Backoff {
                    item_id: updated.id,
                    attempt: updated.attempt_count,
                    delay,
                }))
            }
            RetryDecision::Drop(reason) => {
                if self.inner.store.remove(&updated.id).await? {
                    self.emit_dropped(&updated.owner_id, &updated.id, reason, &failure, updated.attempt_count)
                        .await;
                    return Ok(FailureOutcome::Dropped);
                }
                Ok(FailureOutcome::Vanished)
            }
        }
    }

    /// 根据本轮结果切换阶段；需要退避时安排计时器
    async fn finish(&self, epoch: u64, result: &Result<DrainReport>) {
        let backoff = match result {
            Ok(DrainReport {
                halt: DrainHalt::Backoff { delay, .. },
                ..
            }) => Some(*delay),
            _ => None,
        };

        let (transition, schedule) = {
            let mut machine = self.inner.machine.lock();
            match backoff {
                // owner 已变化时不为旧 owner 安排退避
                Some(delay) if self.epoch() == epoch => (machine.enter_backoff().ok(), Some(delay)),
                _ => (machine.finish(), None),
            }
        };

        if let Some(delay) = schedule {
            self.schedule_backoff(delay);
        }
        if let Some(transition) = transition {
            self.emit_transition(transition).await;
        }
    }

    fn schedule_backoff(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.trigger(TriggerSource::BackoffExpired);
            }
        });
        debug!(delay_ms = delay.as_millis() as u64, "Backoff timer scheduled");
        if let Some(previous) = self.inner.backoff_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_backoff_timer(&self) {
        if let Some(timer) = self.inner.backoff_timer.lock().take() {
            timer.abort();
        }
    }

    async fn emit(&self, event: SyncEvent) {
        self.inner.events.emit(event).await;
    }

    async fn emit_transition(&self, transition: PhaseTransition) {
        debug!(from = transition.from.as_str(), to = transition.to.as_str(), "Sync phase changed");
        self.emit(transition.into_event()).await;
    }

    async fn emit_progress(&self, report: &DrainReport, item_id: &str) {
        self.emit(SyncEvent::SyncProgress {
            owner_id: report.owner_id.clone(),
            item_id: item_id.to_string(),
            processed: report.succeeded + report.dropped,
            total: report.total,
            timestamp: now_millis(),
        })
        .await;
    }

    async fn emit_dropped(
        &self,
        owner_id: &str,
        item_id: &str,
        reason: DropReason,
        failure: &WriteFailure,
        attempts: u32,
    ) {
        warn!(
            owner_id,
            item_id,
            reason = reason.as_str(),
            attempts,
            "Queued write dropped: {}",
            failure
        );
        self.emit(SyncEvent::ItemDropped {
            owner_id: owner_id.to_string(),
            item_id: item_id.to_string(),
            reason,
            failure: failure.kind,
            message: failure.message.clone(),
            attempts,
            timestamp: now_millis(),
        })
        .await;
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_event_loop(
    inner: Weak<EngineInner>,
    mut changes: broadcast::Receiver<ConnectivityChange>,
    token: CancellationToken,
    startup_grace: Duration,
    periodic_interval: Option<Duration>,
) {
    let grace = tokio::time::sleep(startup_grace);
    tokio::pin!(grace);
    let mut grace_pending = true;
    let mut periodic = periodic_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        let source = tokio::select! {
            _ = token.cancelled() => break,
            _ = &mut grace, if grace_pending => {
                grace_pending = false;
                TriggerSource::Startup
            }
            _ = next_tick(&mut periodic) => TriggerSource::Periodic,
            change = changes.recv() => match change {
                Ok(change) if change.is_online_edge() => TriggerSource::ConnectivityRegained,
                Ok(change) if change.is_foreground_edge() => TriggerSource::Foregrounded,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // 丢失的变化里可能有网络恢复
                    warn!(skipped, "Connectivity events lagged");
                    TriggerSource::ConnectivityRegained
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match inner.upgrade() {
            Some(inner) => {
                SyncEngine { inner }.trigger(source);
            }
            None => break,
        }
    }
    debug!("Offline sync event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{AppState, DummyNetworkStatusListener, NetworkMonitor, NetworkStatus};
    use crate::storage::kv::{MemoryBackend, QueueBackend, WriteOp};
    use crate::sync::retry_policy::FailureKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::{Notify, Semaphore};

    type Outcome = std::result::Result<(), WriteFailure>;

    /// 按脚本返回结果的远端；可选闸门用于把调用卡在半路
    struct ScriptedRemote {
        script: Mutex<VecDeque<Outcome>>,
        fallback: Outcome,
        calls: Mutex<Vec<WriteRequest>>,
        gate: Option<Semaphore>,
        entered: Notify,
    }

    impl ScriptedRemote {
        fn new(script: Vec<Outcome>, fallback: Outcome) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
                gate: None,
                entered: Notify::new(),
            }
        }

        fn succeeding() -> Self {
            Self::new(Vec::new(), Ok(()))
        }

        fn failing(failure: WriteFailure) -> Self {
            Self::new(Vec::new(), Err(failure))
        }

        fn gated(mut self) -> Self {
            self.gate = Some(Semaphore::new(0));
            self
        }

        fn release(&self, permits: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(permits);
            }
        }

        fn calls(&self) -> Vec<WriteRequest> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteWrite for ScriptedRemote {
        async fn execute(&self, request: &WriteRequest) -> Outcome {
            self.calls.lock().push(request.clone());
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct Harness {
        engine: SyncEngine,
        backend: Arc<MemoryBackend>,
        store: Arc<QueueStore>,
        events: Arc<EventBus>,
        monitor: Arc<NetworkMonitor>,
        remote: Arc<ScriptedRemote>,
    }

    fn settings(max_attempts: u32, base_delay_ms: u64) -> EngineSettings {
        EngineSettings {
            policy: RetryPolicy::new(max_attempts, base_delay_ms, 60_000, 0.0),
            attempt_timeout: Duration::from_secs(1),
            startup_grace: Duration::from_secs(60),
            periodic_interval: None,
            verbose: true,
        }
    }

    fn harness(remote: ScriptedRemote, settings: EngineSettings) -> Harness {
        let events = Arc::new(EventBus::new(256));
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(QueueStore::new(backend.clone(), events.clone()));
        let monitor = Arc::new(NetworkMonitor::new(Arc::new(DummyNetworkStatusListener::default())));
        monitor.set_status(NetworkStatus::Online);
        let remote = Arc::new(remote);
        let engine = SyncEngine::new(settings, store.clone(), remote.clone(), monitor.clone(), events.clone());
        Harness {
            engine,
            backend,
            store,
            events,
            monitor,
            remote,
        }
    }

    fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// 收集事件直到满足条件（包含该事件）
    async fn collect_until<F>(rx: &mut broadcast::Receiver<SyncEvent>, done: F) -> Vec<SyncEvent>
    where
        F: Fn(&SyncEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            loop {
                let event = rx.recv().await.unwrap();
                let finished = done(&event);
                seen.push(event);
                if finished {
                    return seen;
                }
            }
        })
        .await
        .expect("expected event was not observed")
    }

    fn is_completed(event: &SyncEvent) -> bool {
        matches!(event, SyncEvent::SyncCompleted { .. })
    }

    fn is_idle(event: &SyncEvent) -> bool {
        matches!(event, SyncEvent::PhaseChanged { to: SyncPhase::Idle, .. })
    }

    fn started_by(seen: &[SyncEvent], expected: TriggerSource) -> bool {
        seen.iter()
            .any(|e| matches!(e, SyncEvent::SyncStarted { source, .. } if *source == expected))
    }

    fn finished(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Finished(report) => report,
            DrainOutcome::Skipped(reason) => panic!("drain skipped: {:?}", reason),
        }
    }

    #[tokio::test]
    async fn test_offline_items_drain_when_connectivity_returns() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.monitor.set_status(NetworkStatus::Offline);
        for i in 0..3 {
            h.store.enqueue("u1", &json!({"post": i})).await.unwrap();
        }
        h.engine.set_owner(Some("u1".to_string())).await;
        h.engine.start().unwrap();
        let mut rx = h.events.subscribe();

        h.monitor.set_status(NetworkStatus::Online);
        let seen = collect_until(&mut rx, is_completed).await;

        let progress: Vec<usize> = seen
            .iter()
            .filter_map(|e| match e {
                SyncEvent::SyncProgress { processed, .. } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3]);
        assert!(matches!(
            seen.last(),
            Some(SyncEvent::SyncCompleted {
                succeeded: 3,
                dropped: 0,
                remaining: 0,
                ..
            })
        ));
        assert!(seen.iter().any(|e| matches!(
            e,
            SyncEvent::SyncStarted {
                source: TriggerSource::ConnectivityRegained,
                ..
            }
        )));
        assert!(h.store.list("u1").await.unwrap().is_empty());

        // 投递顺序与入队顺序一致
        let payloads: Vec<_> = h.remote.calls().into_iter().map(|c| c.payload["post"].clone()).collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_without_backoff() {
        let h = harness(ScriptedRemote::failing(WriteFailure::client("rejected")), settings(5, 1000));
        let id = h.store.enqueue("u1", &json!({"post": "bad"})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert_eq!(report.dropped, 1);
        assert_eq!(report.halt, DrainHalt::Emptied);
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
        assert_eq!(h.store.count("u1").await.unwrap(), 0);

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ItemDropped { item_id, reason: DropReason::Permanent, failure: FailureKind::Client, attempts: 1, .. }
                if *item_id == id
        )));
        assert!(!events.iter().any(|e| matches!(e, SyncEvent::RetryScheduled { .. })));
    }

    #[tokio::test]
    async fn test_retryable_failure_exhausts_budget() {
        let h = harness(ScriptedRemote::failing(WriteFailure::server("unavailable")), settings(3, 5));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert!(matches!(report.halt, DrainHalt::Backoff { attempt: 1, .. }));
        assert_eq!(h.engine.phase(), SyncPhase::BackoffWait);

        let mut seen = collect_until(&mut rx, |e| matches!(e, SyncEvent::ItemDropped { .. })).await;
        seen.extend(collect_until(&mut rx, is_idle).await);

        let delays: Vec<u64> = seen
            .iter()
            .filter_map(|e| match e {
                SyncEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![10, 20]);
        assert!(seen.iter().any(|e| matches!(
            e,
            SyncEvent::ItemDropped {
                reason: DropReason::Exhausted,
                attempts: 3,
                ..
            }
        )));
        assert_eq!(h.remote.calls().len(), 3);
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_retryable_failure_halts_at_item() {
        let remote = ScriptedRemote::new(vec![Ok(()), Err(WriteFailure::server("boom"))], Ok(()));
        let h = harness(remote, settings(5, 10_000));
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.store.enqueue("u1", &json!({"post": i})).await.unwrap());
        }
        h.engine.set_owner(Some("u1".to_string())).await;

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 2);
        match &report.halt {
            DrainHalt::Backoff { item_id, attempt, delay } => {
                assert_eq!(item_id, &ids[1]);
                assert_eq!(*attempt, 1);
                assert_eq!(*delay, Duration::from_millis(20_000));
            }
            other => panic!("unexpected halt: {:?}", other),
        }

        let attempted: Vec<_> = h.remote.calls().into_iter().map(|c| c.item_id).collect();
        assert_eq!(attempted, vec![ids[0].clone(), ids[1].clone()]);
        let third = h.store.get(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_attempt_count_increments_once_per_failure() {
        let remote = ScriptedRemote::failing(WriteFailure::network("offline"));
        let h = harness(remote, settings(5, 10_000));
        let id = h.store.enqueue("u1", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;

        h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(h.store.get(&id).await.unwrap().unwrap().attempt_count, 1);

        // 外部触发打断退避
        h.engine.sync_now(TriggerSource::Foregrounded).await.unwrap();
        let item = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 2);
        assert!(item.last_attempt_at.is_some());

        let calls = h.remote.calls();
        assert_eq!(calls[0].attempt, 1);
        assert_eq!(calls[1].attempt, 2);
        assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_owner_change_mid_drain_keeps_items() {
        let h = harness(ScriptedRemote::succeeding().gated(), settings(5, 1000));
        for i in 0..3 {
            h.store.enqueue("u1", &json!({"post": i})).await.unwrap();
        }
        h.engine.set_owner(Some("u1".to_string())).await;

        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.sync_now(TriggerSource::Manual).await });
        h.remote.entered.notified().await;

        h.engine.set_owner(None).await;
        h.remote.release(1);

        let report = finished(running.await.unwrap().unwrap());
        assert_eq!(report.halt, DrainHalt::OwnerChanged);
        assert_eq!(report.succeeded, 0);
        assert_eq!(h.store.count("u1").await.unwrap(), 3);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_single_drain() {
        let h = harness(ScriptedRemote::succeeding().gated(), settings(5, 1000));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync_now(TriggerSource::ConnectivityRegained).await });
        h.remote.entered.notified().await;

        let second = h.engine.sync_now(TriggerSource::Foregrounded).await.unwrap();
        assert_eq!(second, DrainOutcome::Skipped(SkipReason::AlreadyDraining));

        h.remote.release(1);
        let report = finished(first.await.unwrap().unwrap());
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_edge_cancels_backoff() {
        let remote = ScriptedRemote::new(vec![Err(WriteFailure::server("busy"))], Ok(()));
        let h = harness(remote, settings(5, 10_000));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert!(matches!(report.halt, DrainHalt::Backoff { .. }));
        assert_eq!(h.engine.phase(), SyncPhase::BackoffWait);

        // 周期兜底不打断退避
        let periodic = h.engine.sync_now(TriggerSource::Periodic).await.unwrap();
        assert_eq!(periodic.skip_reason(), Some(SkipReason::BackoffPending));

        h.engine.start().unwrap();
        let mut rx = h.events.subscribe();
        h.monitor.set_status(NetworkStatus::Offline);
        h.monitor.set_status(NetworkStatus::Online);

        let seen = collect_until(&mut rx, is_idle).await;
        assert!(seen.iter().any(|e| matches!(e, SyncEvent::SyncCompleted { succeeded: 1, .. })));
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        assert_eq!(h.remote.calls().len(), 2);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_change_cancels_backoff() {
        let h = harness(ScriptedRemote::failing(WriteFailure::server("busy")), settings(5, 10_000));
        h.store.enqueue("u1", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(h.engine.phase(), SyncPhase::BackoffWait);

        h.engine.set_owner(Some("u2".to_string())).await;
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
        assert_eq!(h.engine.current_owner().as_deref(), Some("u2"));
        assert_eq!(h.store.count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_extends_delay() {
        let failure = WriteFailure::rate_limited(Some(Duration::from_secs(30)));
        let h = harness(ScriptedRemote::failing(failure), settings(5, 10));
        h.store.enqueue("u1", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        match report.halt {
            DrainHalt::Backoff { delay, .. } => assert_eq!(delay, Duration::from_secs(30)),
            other => panic!("unexpected halt: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skips_without_owner_or_connectivity() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        let id = h.store.enqueue("u1", &json!({})).await.unwrap();

        let outcome = h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::NoOwner));

        h.engine.set_owner(Some("u1".to_string())).await;
        h.monitor.set_status(NetworkStatus::Offline);
        let outcome = h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Offline));

        assert!(h.remote.calls().is_empty());
        assert_eq!(h.store.get(&id).await.unwrap().unwrap().attempt_count, 0);
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_only_current_owner_is_drained() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.store.enqueue("u1", &json!({})).await.unwrap();
        h.store.enqueue("u2", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u2".to_string())).await;

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.store.count("u1").await.unwrap(), 1);
        assert!(h.remote.calls().iter().all(|c| c.owner_id == "u2"));
    }

    #[tokio::test]
    async fn test_timeout_is_classified_as_network_failure() {
        let mut s = settings(1, 1000);
        s.attempt_timeout = Duration::from_millis(50);
        let h = harness(ScriptedRemote::succeeding().gated(), s);
        h.store.enqueue("u1", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert_eq!(report.dropped, 1);
        assert!(drain_events(&mut rx).iter().any(|e| matches!(
            e,
            SyncEvent::ItemDropped {
                reason: DropReason::Exhausted,
                failure: FailureKind::Network,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_startup_grace_triggers_first_drain() {
        let mut s = settings(5, 1000);
        s.startup_grace = Duration::from_millis(50);
        let h = harness(ScriptedRemote::succeeding(), s);
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        h.engine.start().unwrap();
        let seen = collect_until(&mut rx, is_completed).await;
        assert!(started_by(&seen, TriggerSource::Startup));
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_edge_triggers_drain() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        h.engine.start().unwrap();
        let mut rx = h.events.subscribe();

        h.monitor.set_app_state(AppState::Background);
        h.monitor.set_app_state(AppState::Foreground);
        let seen = collect_until(&mut rx, is_completed).await;
        assert!(started_by(&seen, TriggerSource::Foregrounded));
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_tick_triggers_drain() {
        let mut s = settings(5, 1000);
        s.periodic_interval = Some(Duration::from_millis(50));
        let h = harness(ScriptedRemote::succeeding(), s);
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        h.engine.start().unwrap();
        let seen = collect_until(&mut rx, is_completed).await;
        assert!(started_by(&seen, TriggerSource::Periodic));
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagged_connectivity_events_trigger_drain() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        h.engine.start().unwrap();
        let mut rx = h.events.subscribe();

        // 事件循环还没有机会运行，超出通道容量的变化会让它收到 Lagged
        for i in 0..150 {
            let status = if i % 2 == 0 { NetworkStatus::Limited } else { NetworkStatus::Online };
            h.monitor.set_status(status);
        }
        let seen = collect_until(&mut rx, is_completed).await;
        assert!(started_by(&seen, TriggerSource::ConnectivityRegained));
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_record_is_dropped_and_reported() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.backend
            .apply(vec![WriteOp::Put {
                key: format!("item:{}:zzz", hex::encode("u1")).into_bytes(),
                value: b"{not json".to_vec(),
            }])
            .await
            .unwrap();
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        let mut rx = h.events.subscribe();

        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.halt, DrainHalt::Emptied);
        assert!(h.store.list("u1").await.unwrap().is_empty());
        assert_eq!(h.store.count("u1").await.unwrap(), 0);
        assert!(h.backend.is_empty());

        assert!(drain_events(&mut rx).iter().any(|e| matches!(
            e,
            SyncEvent::ItemDropped {
                item_id,
                reason: DropReason::Unreadable,
                attempts: 0,
                ..
            } if item_id == "zzz"
        )));
        assert_eq!(h.remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_owner_change_during_backoff_retry_does_not_wedge() {
        let remote = ScriptedRemote::new(vec![Err(WriteFailure::server("busy"))], Ok(())).gated();
        let h = harness(remote, settings(5, 5));
        h.store.enqueue("u1", &json!({"post": 1})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;

        h.remote.release(1);
        let report = finished(h.engine.sync_now(TriggerSource::Manual).await.unwrap());
        assert!(matches!(report.halt, DrainHalt::Backoff { .. }));
        h.remote.entered.notified().await;
        let mut rx = h.events.subscribe();

        // 退避到期后的重试卡在远端调用里
        h.remote.entered.notified().await;
        assert_eq!(h.engine.phase(), SyncPhase::Draining);

        h.engine.set_owner(Some("u2".to_string())).await;
        h.remote.release(1);
        collect_until(&mut rx, is_idle).await;
        assert_eq!(h.engine.phase(), SyncPhase::Idle);

        let outcome = h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(finished(outcome).owner_id, "u2");
        assert_eq!(h.store.count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_backoff_expiry_is_ignored() {
        let h = harness(ScriptedRemote::failing(WriteFailure::server("busy")), settings(5, 10_000));
        h.store.enqueue("u1", &json!({})).await.unwrap();
        h.engine.set_owner(Some("u1".to_string())).await;
        h.engine.sync_now(TriggerSource::Manual).await.unwrap();
        assert_eq!(h.engine.phase(), SyncPhase::BackoffWait);

        h.engine.set_owner(None).await;
        h.engine.set_owner(Some("u1".to_string())).await;

        // 计时器被取消前已派生的到期触发
        let outcome = h.engine.sync_now(TriggerSource::BackoffExpired).await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Superseded));
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(ScriptedRemote::succeeding(), settings(5, 1000));
        h.engine.start().unwrap();
        assert!(h.engine.is_running());
        assert!(matches!(h.engine.start(), Err(SyncError::AlreadyRunning)));

        h.engine.stop().await.unwrap();
        assert!(matches!(h.engine.stop().await, Err(SyncError::NotRunning)));
    }

    #[tokio::test]
    async fn test_storage_fault_surfaces_as_error() {
        let events = Arc::new(EventBus::new(64));
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(QueueStore::new(backend.clone(), events.clone()));
        let monitor = Arc::new(NetworkMonitor::new(Arc::new(DummyNetworkStatusListener::default())));
        monitor.set_status(NetworkStatus::Online);
        let engine = SyncEngine::new(
            settings(5, 1000),
            store.clone(),
            Arc::new(ScriptedRemote::succeeding()),
            monitor,
            events,
        );
        store.enqueue("u1", &json!({})).await.unwrap();
        engine.set_owner(Some("u1".to_string())).await;

        backend.set_unavailable(true);
        let err = engine.sync_now(TriggerSource::Manual).await.unwrap_err();
        assert!(err.is_storage_fault());
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }
}
