use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bifrost_bus::{channels, PubSubBus};
use bifrost_common::model::{
    CurrentExecution, ErrorKind, ExecutionContext, ExecutionResult, WorkerRecord, WorkerState,
};
use bifrost_context::ContextStore;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::protocol::WorkItem;
use crate::transport::{SpawnedWorker, WorkerSpawner};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no idle worker became available within the routing timeout")]
    NoIdleWorker,
    #[error("context store error: {0}")]
    Context(String),
    #[error("resize rejected: min_workers must be >= {min}, got {got}")]
    MinWorkersTooLow { min: usize, got: usize },
    #[error("resize rejected: min_workers ({min}) cannot exceed max_workers ({max})")]
    MinExceedsMax { min: usize, max: usize },
}

/// Minimum `min_workers` the pool will accept in a resize (§4.10's
/// `resize` validation: "must be >= 2").
const MIN_WORKERS_FLOOR: usize = 2;

/// Handles a completed/failed/cancelled execution result once the pool
/// manager has updated its own bookkeeping. `bifrost-server` implements
/// this to forward results to callers (HTTP long-poll, gRPC stream, …).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn handle(&self, result: ExecutionResult);
}

/// A `ResultSink` that does nothing, for tests that only care about pool
/// bookkeeping.
pub struct NullResultSink;

#[async_trait]
impl ResultSink for NullResultSink {
    async fn handle(&self, _result: ExecutionResult) {}
}

struct WorkerSlot {
    record: WorkerRecord,
    worker: Box<dyn SpawnedWorker>,
    spawned_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PoolBounds {
    min_workers: usize,
    max_workers: usize,
}

#[derive(Debug, Serialize)]
pub struct ProcessStatus {
    pub process_id: String,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub uptime_seconds: f64,
    pub executions_completed: u64,
    pub pending_recycle: bool,
    pub current_execution_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub started: bool,
    pub shutdown: bool,
    pub worker_id: String,
    pub pool_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub processes: Vec<ProcessStatus>,
}

/// Manages a pool of long-lived worker processes for execution isolation
/// (§4.10). Workers are reused across executions rather than spawned per
/// execution; the manager owns scaling, timeout/crash detection, manual
/// recycling, and heartbeat publishing.
pub struct ProcessPoolManager<C> {
    worker_id: String,
    workers: DashMap<Uuid, WorkerSlot>,
    counter: AtomicU64,
    bounds: tokio::sync::RwLock<PoolBounds>,
    graceful_shutdown: Duration,
    recycle_after_executions: u64,
    heartbeat_interval: Duration,
    registration_ttl: Duration,
    spawner: Arc<dyn WorkerSpawner>,
    context_store: Arc<C>,
    bus: Arc<dyn PubSubBus>,
    registry: Arc<dyn crate::registry::PoolRegistry>,
    result_sink: Arc<dyn ResultSink>,
    result_tx: mpsc::Sender<crate::protocol::WorkResult>,
    result_rx: tokio::sync::Mutex<Option<mpsc::Receiver<crate::protocol::WorkResult>>>,
    idle_notify: Notify,
    started: AtomicBool,
    shutdown: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

pub struct ProcessPoolConfig {
    pub worker_id: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub graceful_shutdown: Duration,
    pub recycle_after_executions: u64,
    pub heartbeat_interval: Duration,
    pub registration_ttl: Duration,
}

impl<C: ContextStore + Send + Sync + 'static> ProcessPoolManager<C> {
    pub fn new(
        config: ProcessPoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        context_store: Arc<C>,
        bus: Arc<dyn PubSubBus>,
        registry: Arc<dyn crate::registry::PoolRegistry>,
        result_sink: Arc<dyn ResultSink>,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::channel(256);
        Self {
            worker_id: config.worker_id,
            workers: DashMap::new(),
            counter: AtomicU64::new(0),
            bounds: tokio::sync::RwLock::new(PoolBounds {
                min_workers: config.min_workers,
                max_workers: config.max_workers,
            }),
            graceful_shutdown: config.graceful_shutdown,
            recycle_after_executions: config.recycle_after_executions,
            heartbeat_interval: config.heartbeat_interval,
            registration_ttl: config.registration_ttl,
            spawner,
            context_store,
            bus,
            registry,
            result_sink,
            result_tx,
            result_rx: tokio::sync::Mutex::new(Some(result_rx)),
            idle_notify: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    fn spawn_one(&self) -> Uuid {
        let worker = self.spawner.spawn(self.result_tx.clone());
        let pid = worker
            .pid()
            .unwrap_or_else(|| self.counter.fetch_add(1, Ordering::SeqCst) as u32);
        let id = Uuid::new_v4();
        let record = WorkerRecord {
            id,
            os_pid: pid,
            state: WorkerState::Idle,
            started_at: Utc::now(),
            current_execution: None,
            completed_count: 0,
            pending_recycle: false,
        };
        info!(worker_id = %id, os_pid = pid, "spawned pool worker");
        self.workers.insert(
            id,
            WorkerSlot {
                record,
                worker,
                spawned_at: Instant::now(),
            },
        );
        id
    }

    fn idle_worker_id(&self) -> Option<Uuid> {
        self.workers.iter().find_map(|entry| {
            let slot = entry.value();
            if !slot.record.pending_recycle && slot.record.state == WorkerState::Idle && slot.worker.is_alive() {
                Some(*entry.key())
            } else {
                None
            }
        })
    }

    async fn wait_for_idle_worker(&self, timeout: Duration) -> Option<Uuid> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = self.idle_worker_id() {
                return Some(id);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.idle_notify.notified()).await;
        }
    }

    /// Routes an execution to an idle worker, scaling up or waiting as
    /// needed (§4.9 step 2 / §4.10's `route_execution`).
    pub async fn route(&self, context: ExecutionContext) -> Result<(), PoolError> {
        let execution_id = context.execution_id.clone();
        let timeout = Duration::from_secs(context.timeout_seconds.max(1));

        self.context_store
            .set(&execution_id, context, Duration::from_secs(3600))
            .await
            .map_err(|e| PoolError::Context(e.to_string()))?;

        let worker_id = match self.idle_worker_id() {
            Some(id) => id,
            None => {
                let can_scale_up = {
                    let bounds = self.bounds.read().await;
                    self.workers.len() < bounds.max_workers
                };
                if can_scale_up {
                    self.spawn_one()
                } else {
                    self.wait_for_idle_worker(Duration::from_secs(30))
                        .await
                        .ok_or(PoolError::NoIdleWorker)?
                }
            }
        };

        let mut slot = self.workers.get_mut(&worker_id).ok_or(PoolError::NoIdleWorker)?;
        slot.record.state = WorkerState::Busy;
        slot.record.current_execution = Some(CurrentExecution {
            execution_id: execution_id.clone(),
            started_at: Utc::now(),
            timeout_seconds: timeout.as_secs(),
        });
        let sender = slot.worker.work_sender();
        drop(slot);

        if sender.send(WorkItem { execution_id }).await.is_err() {
            warn!(worker_id = %worker_id, "work channel closed while routing, treating as crash");
            self.remove_and_replace(worker_id).await;
            return Err(PoolError::NoIdleWorker);
        }

        Ok(())
    }

    async fn remove_and_replace(&self, id: Uuid) {
        self.workers.remove(&id);
        self.top_up_to_min().await;
    }

    async fn top_up_to_min(&self) {
        let min = self.bounds.read().await.min_workers;
        while self.workers.len() < min {
            self.spawn_one();
        }
    }

    /// Spawns `min_workers`, registers in the pool registry, and starts
    /// the monitor/result/heartbeat/cancel/command loops (§4.10 `start`).
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("pool already started");
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let min_workers = self.bounds.read().await.min_workers;
        for _ in 0..min_workers {
            self.spawn_one();
        }

        let (min, max) = {
            let bounds = self.bounds.read().await;
            (bounds.min_workers, bounds.max_workers)
        };
        let mut fields = HashMap::new();
        fields.insert("started_at".to_string(), Utc::now().to_rfc3339());
        fields.insert("status".to_string(), "online".to_string());
        fields.insert("min_workers".to_string(), min.to_string());
        fields.insert("max_workers".to_string(), max.to_string());
        self.registry.register(&self.worker_id, fields, self.registration_ttl).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().monitor_loop()));
        tasks.push(tokio::spawn(self.clone().result_loop()));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        tasks.push(tokio::spawn(self.clone().cancel_listener_loop()));
        tasks.push(tokio::spawn(self.clone().command_listener_loop()));

        info!(worker_id = %self.worker_id, workers = self.workers.len(), "pool started");
    }

    /// Cancels background loops and terminates every worker (§4.10 `stop`).
    pub async fn stop(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(worker_id = %self.worker_id, "pool stopping");

        let tasks = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }

        let ids: Vec<Uuid> = self.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, mut slot)) = self.workers.remove(&id) {
                slot.worker.terminate(self.graceful_shutdown).await;
            }
        }

        self.registry.unregister(&self.worker_id).await;
        let _ = self
            .bus
            .publish(
                channels::WORKER_HEARTBEAT,
                json!({"type": "worker_offline", "worker_id": self.worker_id, "timestamp": Utc::now()}),
            )
            .await;

        self.started.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "pool stopped");
    }

    async fn monitor_loop(self: Arc<Self>) {
        info!("monitor loop started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.check_timeouts().await;
            self.check_process_health().await;
            self.maybe_scale_down().await;
        }
        info!("monitor loop stopped");
    }

    async fn check_timeouts(&self) {
        let timed_out: Vec<Uuid> = self
            .workers
            .iter()
            .filter_map(|entry| {
                let slot = entry.value();
                let exec = slot.record.current_execution.as_ref()?;
                let elapsed = (Utc::now() - exec.started_at).num_seconds().max(0) as u64;
                (slot.record.state == WorkerState::Busy && elapsed > exec.timeout_seconds)
                    .then(|| *entry.key())
            })
            .collect();

        for id in timed_out {
            let Some((_, mut slot)) = self.workers.remove(&id) else { continue };
            let Some(exec) = slot.record.current_execution.take() else { continue };
            warn!(worker_id = %id, execution_id = %exec.execution_id, "execution timed out");
            slot.worker.terminate(self.graceful_shutdown).await;
            self.result_sink.handle(timeout_result(&exec)).await;
            self.top_up_to_min().await;
        }
    }

    async fn check_process_health(&self) {
        let crashed: Vec<Uuid> = self
            .workers
            .iter()
            .filter_map(|entry| (!entry.value().worker.is_alive()).then(|| *entry.key()))
            .collect();

        for id in crashed {
            let Some((_, slot)) = self.workers.remove(&id) else { continue };
            warn!(worker_id = %id, "pool worker crashed");
            if let Some(exec) = &slot.record.current_execution {
                self.result_sink.handle(crash_result(exec)).await;
            }
        }
        self.top_up_to_min().await;
    }

    async fn maybe_scale_down(&self) {
        let min = self.bounds.read().await.min_workers;
        let mut idle: Vec<(Uuid, Instant)> = self
            .workers
            .iter()
            .filter(|e| e.value().record.state == WorkerState::Idle && e.value().worker.is_alive())
            .map(|e| (*e.key(), e.value().spawned_at))
            .collect();

        let excess = self.workers.len().saturating_sub(min);
        if excess == 0 || idle.is_empty() {
            return;
        }
        idle.sort_by_key(|(_, started_at)| *started_at);
        let to_remove: Vec<Uuid> = idle.into_iter().take(excess).map(|(id, _)| id).collect();

        self.publish_scaling("scale_down", to_remove.len()).await;
        for (i, id) in to_remove.iter().enumerate() {
            self.publish_progress("scale_down", i + 1, to_remove.len()).await;
            if let Some((_, mut slot)) = self.workers.remove(id) {
                info!(worker_id = %id, "scaling down idle worker");
                slot.worker.terminate(self.graceful_shutdown).await;
            }
        }
    }

    async fn result_loop(self: Arc<Self>) {
        info!("result loop started");
        let mut rx = self.result_rx.lock().await.take().expect("result_rx taken twice");
        while let Some(work_result) = rx.recv().await {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.handle_result(work_result.result).await;
        }
        info!("result loop stopped");
    }

    async fn handle_result(&self, result: ExecutionResult) {
        let Some(id) = self.workers.iter().find_map(|entry| {
            let matches = entry
                .value()
                .record
                .current_execution
                .as_ref()
                .is_some_and(|e| e.execution_id == result.execution_id);
            matches.then(|| *entry.key())
        }) else {
            warn!(execution_id = %result.execution_id, "result for unknown worker, dropping");
            return;
        };

        let should_recycle = {
            let mut slot = self.workers.get_mut(&id).expect("just located");
            slot.record.current_execution = None;
            slot.record.completed_count += 1;
            slot.record.pending_recycle
                || (self.recycle_after_executions > 0
                    && slot.record.completed_count >= self.recycle_after_executions)
        };

        if should_recycle {
            self.recycle_by_id(id).await;
        } else if let Some(mut slot) = self.workers.get_mut(&id) {
            slot.record.state = WorkerState::Idle;
            drop(slot);
            self.idle_notify.notify_waiters();
        }

        self.result_sink.handle(result).await;
    }

    async fn cancel_listener_loop(self: Arc<Self>) {
        info!("cancel listener loop started");
        let Ok(mut sub) = self.bus.subscribe(channels::CANCEL).await else {
            error!("failed to subscribe to cancel channel");
            return;
        };
        while !self.shutdown.load(Ordering::SeqCst) {
            match sub.recv().await {
                Some(payload) => {
                    if let Some(execution_id) = payload.get("execution_id").and_then(Value::as_str) {
                        self.handle_cancel(execution_id).await;
                    }
                }
                None => break,
            }
        }
        info!("cancel listener loop stopped");
    }

    async fn handle_cancel(&self, execution_id: &str) {
        let Some(id) = self.workers.iter().find_map(|entry| {
            let matches = entry
                .value()
                .record
                .current_execution
                .as_ref()
                .is_some_and(|e| e.execution_id == execution_id);
            matches.then(|| *entry.key())
        }) else {
            return;
        };

        let Some((_, mut slot)) = self.workers.remove(&id) else { return };
        let Some(exec) = slot.record.current_execution.take() else { return };
        info!(execution_id, worker_id = %id, "cancelling execution");
        slot.worker.terminate(self.graceful_shutdown).await;
        self.result_sink.handle(cancel_result(&exec)).await;
        self.top_up_to_min().await;
    }

    async fn command_listener_loop(self: Arc<Self>) {
        let channel = channels::pool_commands(&self.worker_id);
        info!(channel, "command listener loop started");
        let Ok(mut sub) = self.bus.subscribe(&channel).await else {
            error!("failed to subscribe to pool command channel");
            return;
        };
        while !self.shutdown.load(Ordering::SeqCst) {
            match sub.recv().await {
                Some(command) => self.handle_command(command).await,
                None => break,
            }
        }
        info!("command listener loop stopped");
    }

    async fn handle_command(&self, command: Value) {
        match command.get("action").and_then(Value::as_str) {
            Some("recycle_process") => {
                let pid = command.get("pid").and_then(Value::as_u64).map(|p| p as u32);
                let recycled = self.recycle_by_pid(pid).await;
                info!(recycled, "processed recycle_process command");
            }
            Some("recycle_all") => self.recycle_all().await,
            Some("resize") => {
                let min = command.get("min_workers").and_then(Value::as_u64);
                let max = command.get("max_workers").and_then(Value::as_u64);
                if let (Some(min), Some(max)) = (min, max) {
                    if let Err(err) = self.resize(min as usize, max as usize).await {
                        error!(error = %err, "resize command rejected");
                    }
                } else {
                    warn!("resize command missing min_workers or max_workers");
                }
            }
            other => warn!(?other, "unknown pool command action"),
        }
    }

    /// Manually recycles a worker by its OS pid, or any idle worker if
    /// `pid` is `None`. Returns `false` if no eligible worker was found
    /// or the target is currently busy (§4.10's `recycle_process`, keyed
    /// here on `os_pid` — the same field the heartbeat reports — rather
    /// than an index into the pool's internal map).
    pub async fn recycle_by_pid(&self, pid: Option<u32>) -> bool {
        let id = match pid {
            Some(pid) => match self.workers.iter().find(|e| e.value().record.os_pid == pid).map(|e| *e.key()) {
                Some(id) => id,
                None => return false,
            },
            None => match self.idle_worker_id() {
                Some(id) => id,
                None => return false,
            },
        };
        let is_busy = self.workers.get(&id).map(|s| s.record.state == WorkerState::Busy);
        match is_busy {
            None => false,
            Some(true) => {
                warn!(worker_id = %id, "cannot recycle a busy worker");
                false
            }
            Some(false) => {
                self.recycle_by_id(id).await;
                true
            }
        }
    }

    async fn recycle_by_id(&self, id: Uuid) {
        if self.workers.remove(&id).is_none() {
            return;
        }
        let new_id = self.spawn_one();
        info!(worker_id = %id, replacement = %new_id, "recycled worker");
    }

    /// Marks every worker for recycling: idle workers are recycled
    /// immediately by the caller (returned ids); busy workers are
    /// recycled once their current execution finishes, via
    /// `handle_result`'s `pending_recycle` check (§4.10's
    /// `mark_for_recycle`).
    pub fn mark_for_recycle(&self) -> (usize, Vec<Uuid>) {
        let mut idle_ids = Vec::new();
        let total = self.workers.len();
        for mut entry in self.workers.iter_mut() {
            entry.value_mut().record.pending_recycle = true;
            if entry.value().record.state == WorkerState::Idle {
                idle_ids.push(*entry.key());
            }
        }
        (total, idle_ids)
    }

    async fn recycle_all(&self) {
        let (count, idle_ids) = self.mark_for_recycle();
        if count == 0 {
            return;
        }
        self.publish_scaling("recycle_all", count).await;
        for (i, id) in idle_ids.iter().enumerate() {
            self.publish_progress("recycle_all", i + 1, count).await;
            self.recycle_by_id(*id).await;
        }
    }

    /// Dynamically resizes the pool (§4.10's `resize`): scales up
    /// immediately if undersized, marks excess idle workers for removal
    /// if oversized.
    pub async fn resize(&self, new_min: usize, new_max: usize) -> Result<(), PoolError> {
        if new_min < MIN_WORKERS_FLOOR {
            return Err(PoolError::MinWorkersTooLow { min: MIN_WORKERS_FLOOR, got: new_min });
        }
        if new_min > new_max {
            return Err(PoolError::MinExceedsMax { min: new_min, max: new_max });
        }

        let (old_min, old_max) = {
            let mut bounds = self.bounds.write().await;
            let old = (bounds.min_workers, bounds.max_workers);
            bounds.min_workers = new_min;
            bounds.max_workers = new_max;
            old
        };

        let current_size = self.workers.len();
        if current_size < new_min {
            let to_spawn = new_min - current_size;
            self.publish_scaling("scale_up", to_spawn).await;
            for i in 0..to_spawn {
                self.publish_progress("scale_up", i + 1, to_spawn).await;
                self.spawn_one();
            }
        } else if current_size > new_max {
            let excess = current_size - new_max;
            let mut idle: Vec<(Uuid, Instant)> = self
                .workers
                .iter()
                .filter(|e| e.value().record.state == WorkerState::Idle)
                .map(|e| (*e.key(), e.value().spawned_at))
                .collect();
            idle.sort_by_key(|(_, started_at)| *started_at);
            let to_remove: Vec<Uuid> = idle.into_iter().take(excess).map(|(id, _)| id).collect();

            self.publish_scaling("scale_down", to_remove.len()).await;
            for (i, id) in to_remove.iter().enumerate() {
                self.publish_progress("scale_down", i + 1, to_remove.len()).await;
                if let Some((_, mut slot)) = self.workers.remove(id) {
                    slot.worker.terminate(self.graceful_shutdown).await;
                }
            }
        }

        let mut fields = HashMap::new();
        fields.insert("min_workers".to_string(), new_min.to_string());
        fields.insert("max_workers".to_string(), new_max.to_string());
        self.registry.update_fields(&self.worker_id, fields).await;

        let _ = self
            .bus
            .publish(
                channels::WORKER_CONFIG_CHANGED,
                json!({
                    "type": "pool_config_changed",
                    "worker_id": self.worker_id,
                    "old_min": old_min,
                    "old_max": old_max,
                    "new_min": new_min,
                    "new_max": new_max,
                }),
            )
            .await;

        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        info!(interval_s = self.heartbeat_interval.as_secs(), "heartbeat loop started");
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.registry.refresh_ttl(&self.worker_id, self.registration_ttl).await;
            let heartbeat = self.build_heartbeat().await;
            let _ = self.bus.publish(channels::WORKER_HEARTBEAT, heartbeat).await;
        }
        info!("heartbeat loop stopped");
    }

    async fn build_heartbeat(&self) -> Value {
        let status = self.status().await;
        json!({
            "type": "worker_heartbeat",
            "worker_id": status.worker_id,
            "status": "online",
            "timestamp": Utc::now(),
            "pool_size": status.pool_size,
            "min_workers": status.min_workers,
            "max_workers": status.max_workers,
            "processes": status.processes,
        })
    }

    async fn publish_scaling(&self, action: &str, affected: usize) {
        let _ = self
            .bus
            .publish(
                channels::WORKER_SCALING,
                json!({"type": "pool_scaling", "worker_id": self.worker_id, "action": action, "processes_affected": affected}),
            )
            .await;
    }

    async fn publish_progress(&self, action: &str, current: usize, total: usize) {
        let _ = self
            .bus
            .publish(
                channels::WORKER_PROGRESS,
                json!({
                    "type": "pool_progress",
                    "worker_id": self.worker_id,
                    "action": action,
                    "current": current,
                    "total": total,
                }),
            )
            .await;
    }

    /// Snapshot of pool state for the admin API (§4.10's `get_status`).
    pub async fn status(&self) -> PoolStatus {
        let bounds = *self.bounds.read().await;
        let processes = self
            .workers
            .iter()
            .map(|entry| {
                let slot = entry.value();
                ProcessStatus {
                    process_id: entry.key().to_string(),
                    pid: Some(slot.record.os_pid),
                    state: slot.record.state,
                    uptime_seconds: slot.spawned_at.elapsed().as_secs_f64(),
                    executions_completed: slot.record.completed_count,
                    pending_recycle: slot.record.pending_recycle,
                    current_execution_id: slot.record.current_execution.as_ref().map(|e| e.execution_id.clone()),
                }
            })
            .collect();

        PoolStatus {
            started: self.started.load(Ordering::SeqCst),
            shutdown: self.shutdown.load(Ordering::SeqCst),
            worker_id: self.worker_id.clone(),
            pool_size: self.workers.len(),
            min_workers: bounds.min_workers,
            max_workers: bounds.max_workers,
            processes,
        }
    }
}

fn timeout_result(exec: &CurrentExecution) -> ExecutionResult {
    let elapsed = (Utc::now() - exec.started_at).num_milliseconds().max(0) as u64;
    ExecutionResult {
        execution_id: exec.execution_id.clone(),
        success: false,
        value: None,
        error_kind: Some(ErrorKind::TimeoutError),
        error_message: Some(format!("execution exceeded its {}s timeout", exec.timeout_seconds)),
        duration_ms: elapsed,
        input_tokens: None,
        output_tokens: None,
    }
}

fn crash_result(exec: &CurrentExecution) -> ExecutionResult {
    let elapsed = (Utc::now() - exec.started_at).num_milliseconds().max(0) as u64;
    ExecutionResult {
        execution_id: exec.execution_id.clone(),
        success: false,
        value: None,
        error_kind: Some(ErrorKind::ProcessCrashError),
        error_message: Some("worker process crashed unexpectedly".to_string()),
        duration_ms: elapsed,
        input_tokens: None,
        output_tokens: None,
    }
}

fn cancel_result(exec: &CurrentExecution) -> ExecutionResult {
    let elapsed = (Utc::now() - exec.started_at).num_milliseconds().max(0) as u64;
    ExecutionResult {
        execution_id: exec.execution_id.clone(),
        success: false,
        value: None,
        error_kind: Some(ErrorKind::CancelledError),
        error_message: Some("execution was cancelled".to_string()),
        duration_ms: elapsed,
        input_tokens: None,
        output_tokens: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::transport::InProcessSpawner;
    use crate::worker::{ResolvedTarget, WorkflowLookup};
    use bifrost_bus::InMemoryBus;
    use bifrost_context::InMemoryContextStore;
    use bifrost_storage::{InMemoryBlobStore, InMemoryModuleCache, InMemoryTextIndex};

    struct StaticLookup(ResolvedTarget);

    #[async_trait::async_trait]
    impl WorkflowLookup for StaticLookup {
        async fn resolve(&self, _workflow_name: &str) -> Option<ResolvedTarget> {
            Some(self.0.clone())
        }
    }

    struct ChannelSink(mpsc::Sender<ExecutionResult>);

    #[async_trait::async_trait]
    impl ResultSink for ChannelSink {
        async fn handle(&self, result: ExecutionResult) {
            let _ = self.0.send(result).await;
        }
    }

    fn config(min: usize, max: usize) -> ProcessPoolConfig {
        ProcessPoolConfig {
            worker_id: "test-pool".to_string(),
            min_workers: min,
            max_workers: max,
            graceful_shutdown: Duration::from_millis(10),
            recycle_after_executions: 0,
            heartbeat_interval: Duration::from_secs(3600),
            registration_ttl: Duration::from_secs(60),
        }
    }

    fn test_manager(
        min: usize,
        max: usize,
        result_sink: Arc<dyn ResultSink>,
    ) -> Arc<ProcessPoolManager<InMemoryContextStore>> {
        let cache = Arc::new(InMemoryModuleCache::new());
        cache.set("workflows/greet.py", b"ignored".to_vec(), "h".to_string());
        let runtime = Arc::new(MockRuntime::new());
        runtime.register("greet", |ctx| Ok(serde_json::json!(ctx.workflow_name.clone())));
        let lookup: Arc<dyn WorkflowLookup> = Arc::new(StaticLookup(ResolvedTarget {
            path: "workflows/greet.py".to_string(),
            function_symbol: "greet".to_string(),
        }));
        let spawner = Arc::new(InProcessSpawner::new(
            Arc::new(InMemoryContextStore::new()),
            lookup,
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryTextIndex::new()),
            cache,
            runtime,
        ));

        Arc::new(ProcessPoolManager::new(
            config(min, max),
            spawner,
            Arc::new(InMemoryContextStore::new()),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryPoolRegistry::new()),
            result_sink,
        ))
    }

    fn sample_context(execution_id: &str) -> ExecutionContext {
        ExecutionContext {
            execution_id: execution_id.to_string(),
            user_id: "user-1".to_string(),
            org_id: "org-1".to_string(),
            workflow_name: "greet".to_string(),
            parameters: serde_json::json!({}),
            timeout_seconds: 5,
            deadline: Utc::now() + chrono::Duration::seconds(5),
        }
    }

    #[test_r::test(tokio::test)]
    async fn start_spawns_min_workers_and_stop_terminates_them() {
        let pool = test_manager(2, 4, Arc::new(NullResultSink));
        pool.start().await;
        assert_eq!(pool.status().await.pool_size, 2);
        pool.stop().await;
        assert_eq!(pool.status().await.pool_size, 0);
    }

    #[test_r::test(tokio::test)]
    async fn route_executes_and_delivers_result_via_sink() {
        let (tx, mut rx) = mpsc::channel(1);
        let pool = test_manager(1, 2, Arc::new(ChannelSink(tx)));
        pool.start().await;

        pool.route(sample_context("exec-1")).await.unwrap();

        let result = rx.recv().await.unwrap();
        assert!(result.success);
        assert_eq!(result.execution_id, "exec-1");
        assert_eq!(result.value, Some(serde_json::json!("greet")));

        pool.stop().await;
    }

    #[test_r::test(tokio::test)]
    async fn resize_rejects_min_below_floor() {
        let pool = test_manager(2, 4, Arc::new(NullResultSink));
        let err = pool.resize(1, 4).await.unwrap_err();
        assert!(matches!(err, PoolError::MinWorkersTooLow { .. }));
    }

    #[test_r::test(tokio::test)]
    async fn resize_rejects_min_above_max() {
        let pool = test_manager(2, 4, Arc::new(NullResultSink));
        let err = pool.resize(5, 3).await.unwrap_err();
        assert!(matches!(err, PoolError::MinExceedsMax { .. }));
    }

    #[test_r::test(tokio::test)]
    async fn resize_scales_up_to_new_minimum() {
        let pool = test_manager(1, 4, Arc::new(NullResultSink));
        pool.start().await;
        pool.resize(3, 5).await.unwrap();
        assert_eq!(pool.status().await.pool_size, 3);
        pool.stop().await;
    }

    #[test_r::test(tokio::test)]
    async fn recycle_by_pid_recycles_idle_worker_and_respawns() {
        let pool = test_manager(1, 2, Arc::new(NullResultSink));
        pool.start().await;
        let pid = pool.status().await.processes[0].pid.unwrap();

        assert!(pool.recycle_by_pid(Some(pid)).await);
        assert_eq!(pool.status().await.pool_size, 1);

        pool.stop().await;
    }

    #[test_r::test(tokio::test)]
    async fn recycle_by_pid_returns_false_for_unknown_pid() {
        let pool = test_manager(1, 2, Arc::new(NullResultSink));
        pool.start().await;
        assert!(!pool.recycle_by_pid(Some(999_999)).await);
        pool.stop().await;
    }

    #[test_r::test(tokio::test)]
    async fn mark_for_recycle_flags_every_worker() {
        let pool = test_manager(2, 4, Arc::new(NullResultSink));
        pool.start().await;
        let (total, idle_ids) = pool.mark_for_recycle();
        assert_eq!(total, 2);
        assert_eq!(idle_ids.len(), 2);
        pool.stop().await;
    }
}
