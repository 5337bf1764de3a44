//! Experiment and protocol event system.
//!
//! Implement [`EventHandler`] to observe the lab while it works:
//!
//! - **Experiment lifecycle**: submission, dispatch, progress, terminal status
//! - **Queue control**: processing state transitions
//! - **Protocol**: item boundaries and every model turn
//!
//! Both trait methods have no-op defaults, so override only what you need. The handler is
//! shared as `Arc<dyn EventHandler>`: register it on the
//! [`Scheduler`](crate::lab::scheduler::Scheduler) and on the
//! [`ConversationEngine`](crate::lab::protocol::ConversationEngine).
//!
//! ```rust,no_run
//! use cloudllm_lab::event::{EventHandler, ExperimentEvent, ProtocolEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_experiment_event(&self, event: &ExperimentEvent) {
//!         if let ExperimentEvent::Progress { experiment_id, progress, .. } = event {
//!             println!("{} at {}%", experiment_id, progress);
//!         }
//!     }
//!     async fn on_protocol_event(&self, event: &ProtocolEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use crate::lab::experiment::{ExperimentStatus, FinalVerdict};
use crate::lab::scheduler::ProcessingState;
use async_trait::async_trait;

/// Events emitted by the scheduler about whole experiments.
#[derive(Debug, Clone)]
pub enum ExperimentEvent {
    /// A spec was accepted and queued.
    Submitted {
        experiment_id: String,
        name: String,
        priority: i32,
        batch_id: Option<String>,
    },
    /// The dispatch loop moved the experiment to `running`.
    Started {
        experiment_id: String,
        name: String,
    },
    /// An item finished (successfully or not).
    Progress {
        experiment_id: String,
        processed: usize,
        total: usize,
        /// 0..=100.
        progress: u8,
    },
    /// `cancel` was called while the experiment was running.
    CancelRequested { experiment_id: String },
    /// The experiment reached a terminal status.
    Finished {
        experiment_id: String,
        status: ExperimentStatus,
        error: Option<String>,
        duration_seconds: Option<f64>,
    },
    /// `start`, `stop`, `pause` or `resume` changed the processing state.
    ProcessingStateChanged {
        from: ProcessingState,
        to: ProcessingState,
    },
}

/// Events emitted by the conversation engine while it runs one item.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    ItemStarted {
        experiment_id: String,
        item_index: usize,
        item_id: String,
    },
    /// One participant's response for one turn was received and parsed.
    TurnCompleted {
        experiment_id: String,
        item_index: usize,
        /// 1-based.
        turn: usize,
        participant: usize,
        model: String,
        is_adversary: bool,
        response_length: usize,
        verdict: Option<String>,
    },
    ItemCompleted {
        experiment_id: String,
        item_index: usize,
        turns: usize,
        verdict: FinalVerdict,
    },
    /// A provider or parse error stopped the item; the experiment continues.
    ItemFailed {
        experiment_id: String,
        item_index: usize,
        turns: usize,
        error: String,
    },
}

/// Receives lab events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for scheduler-level events. No-op by default.
    async fn on_experiment_event(&self, _event: &ExperimentEvent) {}

    /// Called for per-item protocol events. No-op by default.
    async fn on_protocol_event(&self, _event: &ProtocolEvent) {}
}

/// Forwards every event to the `log` facade: lifecycle at `info`, turns at `debug`,
/// item failures at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_experiment_event(&self, event: &ExperimentEvent) {
        match event {
            ExperimentEvent::Submitted {
                experiment_id,
                name,
                priority,
                batch_id,
            } => log::info!(
                "experiment {} ('{}') queued at priority {}{}",
                experiment_id,
                name,
                priority,
                batch_id
                    .as_ref()
                    .map(|b| format!(" in batch {}", b))
                    .unwrap_or_default()
            ),
            ExperimentEvent::Started {
                experiment_id,
                name,
            } => log::info!("experiment {} ('{}') started", experiment_id, name),
            ExperimentEvent::Progress {
                experiment_id,
                processed,
                total,
                progress,
            } => log::debug!(
                "experiment {}: {}/{} items ({}%)",
                experiment_id,
                processed,
                total,
                progress
            ),
            ExperimentEvent::CancelRequested { experiment_id } => {
                log::info!("experiment {}: cancellation requested", experiment_id)
            }
            ExperimentEvent::Finished {
                experiment_id,
                status,
                error,
                duration_seconds,
            } => match error {
                Some(err) => log::warn!("experiment {} {}: {}", experiment_id, status, err),
                None => log::info!(
                    "experiment {} {} after {:.1}s",
                    experiment_id,
                    status,
                    duration_seconds.unwrap_or_default()
                ),
            },
            ExperimentEvent::ProcessingStateChanged { from, to } => {
                log::info!("queue processing {:?} -> {:?}", from, to)
            }
        }
    }

    async fn on_protocol_event(&self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::ItemStarted {
                experiment_id,
                item_index,
                item_id,
            } => log::debug!(
                "experiment {}: item {} ({}) started",
                experiment_id,
                item_index,
                item_id
            ),
            ProtocolEvent::TurnCompleted {
                experiment_id,
                item_index,
                turn,
                model,
                is_adversary,
                response_length,
                verdict,
                ..
            } => log::debug!(
                "experiment {}: item {} turn {} {}{} -> {} chars, verdict {:?}",
                experiment_id,
                item_index,
                turn,
                model,
                if *is_adversary { " (adversary)" } else { "" },
                response_length,
                verdict
            ),
            ProtocolEvent::ItemCompleted {
                experiment_id,
                item_index,
                turns,
                verdict,
            } => log::debug!(
                "experiment {}: item {} done in {} turns, verdict {}",
                experiment_id,
                item_index,
                turns,
                verdict.label()
            ),
            ProtocolEvent::ItemFailed {
                experiment_id,
                item_index,
                turns,
                error,
            } => log::warn!(
                "experiment {}: item {} failed after {} turns: {}",
                experiment_id,
                item_index,
                turns,
                error
            ),
        }
    }
}
