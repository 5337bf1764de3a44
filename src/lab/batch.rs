//! Batch coordination: submitting and tracking a named group of experiments.
//!
//! A batch owns no truth about its members. Every status query asks the
//! [`Scheduler`] for each member's current state and derives the batch view from that,
//! so a member that fails or is cancelled shows up on the very next read.

use crate::lab::error::LabError;
use crate::lab::experiment::{
    ContextStrategy, ExperimentId, ExperimentSpec, ExperimentState, ExperimentStatus,
    ExperimentType,
};
use crate::lab::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Derived status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    /// Nothing running yet, something still waiting.
    Pending,
    /// At least one member is running.
    Running,
    /// Every member completed.
    Completed,
    /// Every member is terminal and none completed.
    Failed,
    /// Every member is terminal, some completed and some did not.
    Partial,
}

/// One member as seen in a batch status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMember {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub progress: u8,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: BatchPhase,
    /// `completed members / total members`, in 0.0..=1.0.
    pub progress: f64,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub members: Vec<BatchMember>,
}

/// Which members `cancel_batch` acted on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCancellation {
    /// Members that were pending or running and received a cancel.
    pub cancelled: Vec<ExperimentId>,
    /// Members already terminal.
    pub skipped: Vec<ExperimentId>,
    /// Members the scheduler no longer knows.
    pub not_found: Vec<ExperimentId>,
}

/// Per-member line of a [`BatchSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub experiment_type: ExperimentType,
    pub models: Vec<String>,
    pub adversarial: bool,
    pub context_strategy: ContextStrategy,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub items_succeeded: Option<usize>,
    pub items_failed: Option<usize>,
    pub error: Option<String>,
}

/// Report over a batch's members, suitable for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: BatchPhase,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `completed / total`.
    pub success_rate: f64,
    /// From the earliest member start to the latest member completion.
    pub total_duration_seconds: Option<f64>,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone)]
struct BatchRecord {
    id: String,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
    experiment_ids: Vec<ExperimentId>,
}

#[derive(Default)]
struct BatchBook {
    batches: HashMap<String, BatchRecord>,
    order: Vec<String>,
}

/// Fans batches out to a [`Scheduler`] and aggregates their status.
pub struct BatchCoordinator {
    scheduler: Scheduler,
    book: Mutex<BatchBook>,
}

impl BatchCoordinator {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            book: Mutex::new(BatchBook::default()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn book(&self) -> MutexGuard<'_, BatchBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, batch_id: &str) -> Result<BatchRecord, LabError> {
        self.book()
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| LabError::BatchNotFound(batch_id.to_string()))
    }

    /// Submit every spec, each at its own priority, and record them as one batch.
    pub async fn submit_batch(
        &self,
        name: &str,
        description: &str,
        specs: Vec<ExperimentSpec>,
    ) -> Result<String, LabError> {
        if specs.is_empty() {
            return Err(LabError::EmptyBatch);
        }
        let batch_id = Uuid::new_v4().to_string();
        let count = specs.len();
        let mut experiment_ids = Vec::with_capacity(count);
        for spec in specs {
            let priority = spec.priority;
            let id = self
                .scheduler
                .enqueue(spec, priority, Some(batch_id.clone()))
                .await;
            experiment_ids.push(id);
        }

        let mut book = self.book();
        book.order.push(batch_id.clone());
        book.batches.insert(
            batch_id.clone(),
            BatchRecord {
                id: batch_id.clone(),
                name: name.to_string(),
                description: description.to_string(),
                created_at: Utc::now(),
                experiment_ids,
            },
        );
        log::info!("batch {} ('{}') queued {} experiment(s)", batch_id, name, count);
        Ok(batch_id)
    }

    fn members(&self, record: &BatchRecord) -> Vec<ExperimentState> {
        record
            .experiment_ids
            .iter()
            .filter_map(|id| self.scheduler.get_status(id).ok())
            .collect()
    }

    pub fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus, LabError> {
        let record = self.record(batch_id)?;
        Ok(self.status_of(&record))
    }

    fn status_of(&self, record: &BatchRecord) -> BatchStatus {
        let members = self.members(record);
        let statuses: Vec<ExperimentStatus> = members.iter().map(|m| m.status).collect();
        let count = |s: ExperimentStatus| statuses.iter().filter(|x| **x == s).count();
        let total = record.experiment_ids.len();
        let completed = count(ExperimentStatus::Completed);

        BatchStatus {
            batch_id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            created_at: record.created_at,
            status: derive_phase(&statuses),
            progress: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            total,
            pending: count(ExperimentStatus::Pending),
            running: count(ExperimentStatus::Running),
            completed,
            failed: count(ExperimentStatus::Failed),
            cancelled: count(ExperimentStatus::Cancelled),
            members: members
                .into_iter()
                .map(|m| BatchMember {
                    experiment_id: m.id,
                    name: m.spec.name,
                    status: m.status,
                    progress: m.progress,
                    error: m.error,
                })
                .collect(),
        }
    }

    /// Cancel every member that is still pending or running. Members are cancelled one by
    /// one; the report says what happened to each.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<BatchCancellation, LabError> {
        let record = self.record(batch_id)?;
        let mut report = BatchCancellation::default();
        for id in record.experiment_ids {
            match self.scheduler.get_status(&id) {
                Ok(state) if state.status.is_active() => match self.scheduler.cancel(&id).await {
                    Ok(_) => report.cancelled.push(id),
                    Err(_) => report.not_found.push(id),
                },
                Ok(_) => report.skipped.push(id),
                Err(_) => report.not_found.push(id),
            }
        }
        log::info!(
            "batch {}: cancelled {}, skipped {}",
            batch_id,
            report.cancelled.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Status of every batch, oldest first.
    pub fn list_batches(&self) -> Vec<BatchStatus> {
        let records: Vec<BatchRecord> = {
            let book = self.book();
            book.order
                .iter()
                .filter_map(|id| book.batches.get(id).cloned())
                .collect()
        };
        records.iter().map(|r| self.status_of(r)).collect()
    }

    /// Forget a batch. Its experiments stay in the scheduler untouched.
    pub fn delete_batch(&self, batch_id: &str) -> Result<(), LabError> {
        let mut book = self.book();
        if book.batches.remove(batch_id).is_none() {
            return Err(LabError::BatchNotFound(batch_id.to_string()));
        }
        book.order.retain(|id| id != batch_id);
        Ok(())
    }

    pub fn batch_summary(&self, batch_id: &str) -> Result<BatchSummary, LabError> {
        let record = self.record(batch_id)?;
        let members = self.members(&record);
        let statuses: Vec<ExperimentStatus> = members.iter().map(|m| m.status).collect();
        let count = |s: ExperimentStatus| statuses.iter().filter(|x| **x == s).count();
        let total = record.experiment_ids.len();
        let completed = count(ExperimentStatus::Completed);

        let first_start = members.iter().filter_map(|m| m.started_at).min();
        let last_end = members.iter().filter_map(|m| m.completed_at).max();
        let total_duration_seconds = match (first_start, last_end) {
            (Some(start), Some(end)) if end >= start => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };

        Ok(BatchSummary {
            batch_id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            created_at: record.created_at,
            status: derive_phase(&statuses),
            total,
            completed,
            failed: count(ExperimentStatus::Failed),
            cancelled: count(ExperimentStatus::Cancelled),
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            total_duration_seconds,
            members: members
                .into_iter()
                .map(|m| MemberSummary {
                    duration_seconds: m.duration_seconds(),
                    items_succeeded: m.metrics.as_ref().map(|x| x.items_succeeded),
                    items_failed: m.metrics.as_ref().map(|x| x.items_failed),
                    experiment_id: m.id,
                    name: m.spec.name,
                    experiment_type: m.spec.experiment_type,
                    models: m.spec.models.iter().map(|x| x.to_string()).collect(),
                    adversarial: m.spec.adversarial,
                    context_strategy: m.spec.context_strategy,
                    status: m.status,
                    started_at: m.started_at,
                    completed_at: m.completed_at,
                    error: m.error,
                })
                .collect(),
        })
    }
}

/// Aggregate member statuses: running beats pending; once everything is terminal the batch
/// is completed, failed (no member completed) or partial.
pub fn derive_phase(statuses: &[ExperimentStatus]) -> BatchPhase {
    if statuses.contains(&ExperimentStatus::Running) {
        return BatchPhase::Running;
    }
    if statuses.contains(&ExperimentStatus::Pending) {
        return BatchPhase::Pending;
    }
    let completed = statuses
        .iter()
        .filter(|s| **s == ExperimentStatus::Completed)
        .count();
    if !statuses.is_empty() && completed == statuses.len() {
        BatchPhase::Completed
    } else if completed == 0 {
        BatchPhase::Failed
    } else {
        BatchPhase::Partial
    }
}
