//! The concurrency scheduler: admission control and lifecycle ownership for experiments.
//!
//! A [`Scheduler`] owns every [`ExperimentState`]. Experiments wait in a priority-ordered
//! pending set (lower number first, FIFO within equal priority) until the dispatch loop
//! grants them one of `max_concurrent_experiments` slots. Each admitted experiment runs on its
//! own tokio task; runners report progress back through a [`RunObserver`] and the scheduler
//! applies every state transition itself.
//!
//! ```text
//! submit ─► pending ──dispatch──► running ──runner returns──► completed | failed | cancelled
//!              │                     │
//!              └──cancel──► cancelled └──cancel──► (token set) ──runner returns──► cancelled
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use cloudllm_lab::dataset::FileDatasetSource;
//! use cloudllm_lab::domain::DomainRegistry;
//! use cloudllm_lab::experiment::{ExperimentSpec, ExperimentType};
//! use cloudllm_lab::protocol::ConversationEngine;
//! use cloudllm_lab::provider::ProviderRegistry;
//! use cloudllm_lab::runner::ExperimentRunner;
//! use cloudllm_lab::scheduler::Scheduler;
//! use cloudllm_lab::LabConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LabConfig::from_env()?;
//!     let engine = ConversationEngine::new(Arc::new(ProviderRegistry::from_config(&config)));
//!     let runner = ExperimentRunner::from_config(
//!         &config,
//!         engine,
//!         Arc::new(DomainRegistry::with_builtin()),
//!         Arc::new(FileDatasetSource::with_root("data")),
//!     );
//!     let scheduler = Scheduler::new(&config, Arc::new(runner))?;
//!     scheduler.start_processing().await;
//!
//!     let spec = ExperimentSpec::new("fn-single", "fake_news", ExperimentType::Single, "news.csv")
//!         .with_model("openai");
//!     let id = scheduler.submit(spec).await;
//!     let finished = scheduler.wait_for_terminal(&id).await?;
//!     println!("{} -> {}", id, finished.status);
//!     Ok(())
//! }
//! ```

use crate::lab::config::LabConfig;
use crate::lab::error::LabError;
use crate::lab::event::{EventHandler, ExperimentEvent};
use crate::lab::experiment::{
    ExperimentId, ExperimentMetrics, ExperimentSpec, ExperimentState, ExperimentStatus,
    ItemOutcome,
};
use crate::lab::runner::{ExperimentExecutor, ExperimentRun, RunObserver, RunOutcome};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Whether the dispatch loop admits new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// No dispatch loop is running.
    Stopped,
    Running,
    /// The loop is alive but admits nothing; running experiments continue.
    Paused,
}

/// Aggregate view over the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub processing_state: ProcessingState,
    pub max_concurrent: usize,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `running / max_concurrent`.
    pub utilization: f64,
    /// `completed / (completed + failed)`, 0 when nothing has finished.
    pub success_rate: f64,
    /// The next pending experiments in dispatch order (at most three).
    pub next_up: Vec<ExperimentId>,
}

/// Results of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub metrics: Option<ExperimentMetrics>,
    pub outcomes: Vec<ItemOutcome>,
}

/// Heap entry: the max of the heap is the lowest priority number, then the lowest sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: i32,
    sequence: u64,
    id: ExperimentId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    experiments: HashMap<ExperimentId, ExperimentState>,
    submission_order: Vec<ExperimentId>,
    /// May hold stale entries for experiments cancelled while pending; skipped on pop.
    pending: BinaryHeap<PendingEntry>,
    running: HashMap<ExperimentId, CancellationToken>,
    processing: ProcessingState,
    dispatch_loop_alive: bool,
    next_sequence: u64,
}

struct SchedulerInner {
    state: Mutex<QueueState>,
    max_concurrent: usize,
    default_priority: i32,
    executor: Arc<dyn ExperimentExecutor>,
    wake: Notify,
    generation: watch::Sender<u64>,
    event_handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

/// Owns the experiment queue. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct Admitted {
    id: ExperimentId,
    name: String,
    spec: ExperimentSpec,
    cancel: CancellationToken,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    async fn emit(&self, event: ExperimentEvent) {
        let handler = self
            .event_handler
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler.on_experiment_event(&event).await;
        }
    }

    /// Move as many pending experiments to `running` as slots and processing state allow.
    fn admit(&self) -> Vec<Admitted> {
        let mut state = self.lock();
        let mut admitted = Vec::new();
        while state.processing == ProcessingState::Running
            && state.running.len() < self.max_concurrent
        {
            let Some(entry) = state.pending.pop() else {
                break;
            };
            let Some(experiment) = state.experiments.get_mut(&entry.id) else {
                continue;
            };
            if experiment.status != ExperimentStatus::Pending {
                continue;
            }
            experiment.status = ExperimentStatus::Running;
            experiment.started_at = Some(Utc::now());
            let cancel = CancellationToken::new();
            admitted.push(Admitted {
                id: entry.id.clone(),
                name: experiment.spec.name.clone(),
                spec: experiment.spec.clone(),
                cancel: cancel.clone(),
            });
            state.running.insert(entry.id, cancel);
        }
        admitted
    }

    /// Apply the runner's outcome and free the slot.
    async fn complete(self: &Arc<Self>, id: &str, outcome: RunOutcome) {
        let finished = {
            let mut state = self.lock();
            state.running.remove(id);
            match state.experiments.get_mut(id) {
                Some(experiment) if !experiment.status.is_terminal() => {
                    let now = Utc::now();
                    experiment.completed_at = Some(now);
                    let (status, mut metrics, error) = match outcome {
                        RunOutcome::Completed(metrics) if !experiment.cancel_requested => {
                            (ExperimentStatus::Completed, Some(metrics), None)
                        }
                        RunOutcome::Completed(metrics) | RunOutcome::Cancelled(metrics) => {
                            (ExperimentStatus::Cancelled, Some(metrics), None)
                        }
                        RunOutcome::Failed(reason) if experiment.cancel_requested => {
                            (ExperimentStatus::Cancelled, None, Some(reason))
                        }
                        RunOutcome::Failed(reason) => (ExperimentStatus::Failed, None, Some(reason)),
                    };
                    let duration = experiment.duration_seconds();
                    if let Some(metrics) = metrics.as_mut() {
                        metrics.duration_seconds = duration;
                    }
                    if status == ExperimentStatus::Completed {
                        experiment.progress = 100;
                    }
                    experiment.status = status;
                    experiment.metrics = metrics;
                    experiment.error = error.clone();
                    Some((status, error, duration))
                }
                _ => None,
            }
        };

        self.bump();
        if let Some((status, error, duration_seconds)) = finished {
            match status {
                ExperimentStatus::Failed => log::error!(
                    "experiment {} failed: {}",
                    id,
                    error.as_deref().unwrap_or("unknown error")
                ),
                _ => log::info!("experiment {} {}", id, status),
            }
            self.emit(ExperimentEvent::Finished {
                experiment_id: id.to_string(),
                status,
                error,
                duration_seconds,
            })
            .await;
        }
        self.wake.notify_one();
    }

    fn spawn_run(self: &Arc<Self>, admitted: Admitted) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .emit(ExperimentEvent::Started {
                    experiment_id: admitted.id.clone(),
                    name: admitted.name.clone(),
                })
                .await;

            let run = ExperimentRun {
                id: admitted.id.clone(),
                spec: Arc::new(admitted.spec),
                cancel: admitted.cancel,
                observer: Arc::new(RunReporter {
                    inner: Arc::clone(&inner),
                    id: admitted.id.clone(),
                }),
            };
            let executor = Arc::clone(&inner.executor);
            let handle = tokio::spawn(async move { executor.execute(run).await });
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => RunOutcome::Failed(format!(
                    "runner task panicked: {}",
                    panic_message(e.into_panic())
                )),
                Err(e) => RunOutcome::Failed(format!("runner task aborted: {}", e)),
            };
            inner.complete(&admitted.id, outcome).await;
        });
    }

    async fn dispatch_loop(self: Arc<Self>) {
        log::debug!("dispatch loop started");
        loop {
            {
                let mut state = self.lock();
                if state.processing == ProcessingState::Stopped {
                    state.dispatch_loop_alive = false;
                    break;
                }
            }
            let admitted = self.admit();
            if !admitted.is_empty() {
                self.bump();
            }
            for experiment in admitted {
                log::info!(
                    "dispatching experiment {} ('{}')",
                    experiment.id,
                    experiment.name
                );
                self.spawn_run(experiment);
            }
            self.wake.notified().await;
        }
        log::debug!("dispatch loop stopped");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The scheduler's state-update interface for one running experiment.
struct RunReporter {
    inner: Arc<SchedulerInner>,
    id: ExperimentId,
}

#[async_trait]
impl RunObserver for RunReporter {
    async fn items_selected(&self, total: usize) {
        {
            let mut state = self.inner.lock();
            if let Some(experiment) = state.experiments.get_mut(&self.id) {
                experiment.items_total = Some(total);
            }
        }
        self.inner.bump();
    }

    async fn item_finished(&self, outcome: ItemOutcome, processed: usize, total: usize) {
        let progress = if total == 0 {
            100
        } else {
            ((processed.min(total) * 100) / total) as u8
        };
        {
            let mut state = self.inner.lock();
            if let Some(experiment) = state.experiments.get_mut(&self.id) {
                if experiment.status == ExperimentStatus::Running {
                    experiment.results.push(outcome);
                    experiment.progress = progress;
                }
            }
        }
        self.inner.bump();
        self.inner
            .emit(ExperimentEvent::Progress {
                experiment_id: self.id.clone(),
                processed,
                total,
                progress,
            })
            .await;
    }
}

impl Scheduler {
    /// Create a scheduler with the configured concurrency ceiling. Processing starts
    /// stopped; call [`start_processing`](Self::start_processing).
    pub fn new(config: &LabConfig, executor: Arc<dyn ExperimentExecutor>) -> Result<Self, LabError> {
        if config.max_concurrent_experiments == 0 {
            return Err(LabError::Config(
                "max_concurrent_experiments must be at least 1".into(),
            ));
        }
        let (generation, _) = watch::channel(0u64);
        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(QueueState {
                    experiments: HashMap::new(),
                    submission_order: Vec::new(),
                    pending: BinaryHeap::new(),
                    running: HashMap::new(),
                    processing: ProcessingState::Stopped,
                    dispatch_loop_alive: false,
                    next_sequence: 0,
                }),
                max_concurrent: config.max_concurrent_experiments,
                default_priority: config.default_priority,
                executor,
                wake: Notify::new(),
                generation,
                event_handler: RwLock::new(None),
            }),
        })
    }

    /// Route experiment events to `handler`.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self
            .inner
            .event_handler
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn default_priority(&self) -> i32 {
        self.inner.default_priority
    }

    /// Queue `spec` at its own priority.
    pub async fn submit(&self, spec: ExperimentSpec) -> ExperimentId {
        let priority = spec.priority;
        self.enqueue(spec, priority, None).await
    }

    /// Queue `spec` at an explicit priority (lower runs sooner).
    pub async fn submit_with_priority(&self, spec: ExperimentSpec, priority: i32) -> ExperimentId {
        self.enqueue(spec, priority, None).await
    }

    pub(crate) async fn enqueue(
        &self,
        spec: ExperimentSpec,
        priority: i32,
        batch_id: Option<String>,
    ) -> ExperimentId {
        let id = Uuid::new_v4().to_string();
        let name = spec.name.clone();
        {
            let mut state = self.inner.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.experiments.insert(
                id.clone(),
                ExperimentState::new(id.clone(), spec, priority, batch_id.clone()),
            );
            state.submission_order.push(id.clone());
            state.pending.push(PendingEntry {
                priority,
                sequence,
                id: id.clone(),
            });
        }
        self.inner.bump();
        self.inner
            .emit(ExperimentEvent::Submitted {
                experiment_id: id.clone(),
                name,
                priority,
                batch_id,
            })
            .await;
        self.inner.wake.notify_one();
        id
    }

    async fn transition(&self, apply: impl FnOnce(ProcessingState) -> ProcessingState) {
        let (from, to, spawn_loop) = {
            let mut state = self.inner.lock();
            let from = state.processing;
            let to = apply(from);
            state.processing = to;
            let spawn_loop = to != ProcessingState::Stopped && !state.dispatch_loop_alive;
            if spawn_loop {
                state.dispatch_loop_alive = true;
            }
            (from, to, spawn_loop)
        };
        if spawn_loop {
            tokio::spawn(Arc::clone(&self.inner).dispatch_loop());
        }
        self.inner.wake.notify_one();
        if from != to {
            self.inner.bump();
            self.inner
                .emit(ExperimentEvent::ProcessingStateChanged { from, to })
                .await;
        }
    }

    /// Begin (or continue) admitting work. No-op when already running.
    pub async fn start_processing(&self) {
        self.transition(|_| ProcessingState::Running).await;
    }

    /// Stop the dispatch loop. Running experiments finish normally.
    pub async fn stop_processing(&self) {
        self.transition(|_| ProcessingState::Stopped).await;
    }

    /// Halt new dispatch without stopping the loop. Only affects a running queue.
    pub async fn pause_processing(&self) {
        self.transition(|s| match s {
            ProcessingState::Running => ProcessingState::Paused,
            other => other,
        })
        .await;
    }

    /// Leave the paused state. No-op unless paused.
    pub async fn resume_processing(&self) {
        self.transition(|s| match s {
            ProcessingState::Paused => ProcessingState::Running,
            other => other,
        })
        .await;
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.inner.lock().processing
    }

    /// Cancel an experiment. Pending experiments become `cancelled` immediately; running ones
    /// are flagged and become `cancelled` when their runner returns. Terminal experiments are
    /// left alone. Returns the status right after the call.
    pub async fn cancel(&self, id: &str) -> Result<ExperimentStatus, LabError> {
        let (status, requested) = {
            let mut state = self.inner.lock();
            let token = state.running.get(id).cloned();
            let experiment = state
                .experiments
                .get_mut(id)
                .ok_or_else(|| LabError::ExperimentNotFound(id.to_string()))?;
            match experiment.status {
                ExperimentStatus::Pending => {
                    experiment.status = ExperimentStatus::Cancelled;
                    experiment.completed_at = Some(Utc::now());
                    (ExperimentStatus::Cancelled, false)
                }
                ExperimentStatus::Running => {
                    let first_request = !experiment.cancel_requested;
                    experiment.cancel_requested = true;
                    if let Some(token) = token {
                        token.cancel();
                    }
                    (ExperimentStatus::Running, first_request)
                }
                terminal => (terminal, false),
            }
        };

        self.inner.bump();
        if requested {
            self.inner
                .emit(ExperimentEvent::CancelRequested {
                    experiment_id: id.to_string(),
                })
                .await;
        } else if status == ExperimentStatus::Cancelled {
            log::info!("experiment {} cancelled before dispatch", id);
            self.inner
                .emit(ExperimentEvent::Finished {
                    experiment_id: id.to_string(),
                    status,
                    error: None,
                    duration_seconds: None,
                })
                .await;
        }
        self.inner.wake.notify_one();
        Ok(status)
    }

    /// Snapshot of one experiment.
    pub fn get_status(&self, id: &str) -> Result<ExperimentState, LabError> {
        self.inner
            .lock()
            .experiments
            .get(id)
            .cloned()
            .ok_or_else(|| LabError::ExperimentNotFound(id.to_string()))
    }

    /// Snapshots of every experiment, in submission order.
    pub fn list_all(&self) -> Vec<ExperimentState> {
        let state = self.inner.lock();
        state
            .submission_order
            .iter()
            .filter_map(|id| state.experiments.get(id).cloned())
            .collect()
    }

    pub fn get_queue_metrics(&self) -> QueueMetrics {
        let state = self.inner.lock();
        let mut counts: HashMap<ExperimentStatus, usize> = HashMap::new();
        for experiment in state.experiments.values() {
            *counts.entry(experiment.status).or_insert(0) += 1;
        }
        let count = |s: ExperimentStatus| counts.get(&s).copied().unwrap_or(0);
        let running = count(ExperimentStatus::Running);
        let completed = count(ExperimentStatus::Completed);
        let failed = count(ExperimentStatus::Failed);

        let mut waiting: Vec<&PendingEntry> = state
            .pending
            .iter()
            .filter(|e| {
                state
                    .experiments
                    .get(&e.id)
                    .map_or(false, |x| x.status == ExperimentStatus::Pending)
            })
            .collect();
        waiting.sort_by(|a, b| b.cmp(a));

        QueueMetrics {
            processing_state: state.processing,
            max_concurrent: self.inner.max_concurrent,
            total: state.experiments.len(),
            pending: count(ExperimentStatus::Pending),
            running,
            completed,
            failed,
            cancelled: count(ExperimentStatus::Cancelled),
            utilization: running as f64 / self.inner.max_concurrent as f64,
            success_rate: if completed + failed == 0 {
                0.0
            } else {
                completed as f64 / (completed + failed) as f64
            },
            next_up: waiting.into_iter().take(3).map(|e| e.id.clone()).collect(),
        }
    }

    /// Item outcomes and metrics recorded so far for one experiment.
    pub fn results(&self, id: &str) -> Result<ExperimentResults, LabError> {
        let state = self.get_status(id)?;
        Ok(ExperimentResults {
            experiment_id: state.id,
            status: state.status,
            metrics: state.metrics,
            outcomes: state.results,
        })
    }

    /// Wait until the experiment reaches a terminal status and return its final snapshot.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<ExperimentState, LabError> {
        let mut changes = self.inner.generation.subscribe();
        loop {
            let snapshot = self.get_status(id)?;
            if snapshot.status.is_terminal() || changes.changed().await.is_err() {
                return Ok(snapshot);
            }
        }
    }

    /// Wait until no experiment is pending or running.
    pub async fn wait_until_idle(&self) {
        let mut changes = self.inner.generation.subscribe();
        loop {
            let busy = self
                .inner
                .lock()
                .experiments
                .values()
                .any(|e| e.status.is_active());
            if !busy || changes.changed().await.is_err() {
                return;
            }
        }
    }
}
