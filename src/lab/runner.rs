//! The experiment runner: drives the conversation protocol across a whole dataset.
//!
//! The [`Scheduler`](crate::lab::scheduler::Scheduler) hands every admitted experiment to an
//! [`ExperimentExecutor`] as an [`ExperimentRun`]. The runner never touches the experiment's
//! state directly; it reports through the run's [`RunObserver`] and returns a [`RunOutcome`].

use crate::lab::config::{LabConfig, DEFAULT_MAX_ITEMS_PER_EXPERIMENT};
use crate::lab::dataset::DatasetSource;
use crate::lab::domain::{DomainModule, DomainRegistry};
use crate::lab::experiment::{
    ExperimentId, ExperimentMetrics, ExperimentSpec, ExperimentType, FinalVerdict, ItemOutcome,
};
use crate::lab::protocol::{participant_names, ConversationEngine};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives progress from a running experiment.
#[async_trait]
pub trait RunObserver: Send + Sync {
    /// The dataset is loaded and `total` items were selected.
    async fn items_selected(&self, total: usize);

    /// An item finished; `processed` items out of `total` are done.
    async fn item_finished(&self, outcome: ItemOutcome, processed: usize, total: usize);
}

/// One admitted experiment, as handed to an executor.
pub struct ExperimentRun {
    pub id: ExperimentId,
    pub spec: Arc<ExperimentSpec>,
    /// Polled before every item.
    pub cancel: CancellationToken,
    pub observer: Arc<dyn RunObserver>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run went through every selected item (some may have failed individually).
    Completed(ExperimentMetrics),
    /// The cancellation token was observed; metrics cover the items processed before it.
    Cancelled(ExperimentMetrics),
    /// A systemic error: nothing usable was produced.
    Failed(String),
}

/// Runs experiments. Implemented by [`ExperimentRunner`]; tests plug in their own.
#[async_trait]
pub trait ExperimentExecutor: Send + Sync {
    async fn execute(&self, run: ExperimentRun) -> RunOutcome;
}

/// The standard executor.
pub struct ExperimentRunner {
    engine: ConversationEngine,
    domains: Arc<DomainRegistry>,
    datasets: Arc<dyn DatasetSource>,
    max_items: usize,
}

impl ExperimentRunner {
    pub fn new(
        engine: ConversationEngine,
        domains: Arc<DomainRegistry>,
        datasets: Arc<dyn DatasetSource>,
    ) -> Self {
        Self {
            engine,
            domains,
            datasets,
            max_items: DEFAULT_MAX_ITEMS_PER_EXPERIMENT,
        }
    }

    /// A runner capped at `config.max_items_per_experiment` items per experiment.
    pub fn from_config(
        config: &LabConfig,
        engine: ConversationEngine,
        domains: Arc<DomainRegistry>,
        datasets: Arc<dyn DatasetSource>,
    ) -> Self {
        Self::new(engine, domains, datasets).with_max_items(config.max_items_per_experiment)
    }

    /// Cap on items per experiment, applied on top of each experiment's own `item_limit`.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    fn preflight(&self, spec: &ExperimentSpec) -> Result<Arc<dyn DomainModule>, String> {
        let domain = self
            .domains
            .get(&spec.domain)
            .ok_or_else(|| format!("unknown domain module '{}'", spec.domain))?;
        spec.validate().map_err(|e| e.to_string())?;
        if spec.adversarial && !spec.runs_adversarial() {
            log::warn!(
                "experiment '{}': adversarial flag ignored for a {} run",
                spec.name,
                spec.experiment_type
            );
        }
        if let Some(missing) = spec
            .participants()
            .iter()
            .find(|m| !self.engine.providers().contains(&m.provider))
        {
            return Err(format!("provider '{}' is not registered", missing.provider));
        }
        Ok(domain)
    }
}

#[async_trait]
impl ExperimentExecutor for ExperimentRunner {
    async fn execute(&self, run: ExperimentRun) -> RunOutcome {
        let spec = run.spec.as_ref();
        let domain = match self.preflight(spec) {
            Ok(domain) => domain,
            Err(reason) => return RunOutcome::Failed(reason),
        };

        if run.cancel.is_cancelled() {
            return RunOutcome::Cancelled(ExperimentMetrics {
                cancelled: true,
                ..ExperimentMetrics::default()
            });
        }

        let limit = spec
            .item_limit
            .map_or(self.max_items, |l| l.min(self.max_items));
        let mut items = match self.datasets.load(&spec.dataset, Some(limit)).await {
            Ok(items) => items,
            Err(e) => return RunOutcome::Failed(e.to_string()),
        };
        items.truncate(limit);
        let total = items.len();
        run.observer.items_selected(total).await;
        log::info!(
            "experiment {}: running {} {} item(s) over '{}'",
            run.id,
            total,
            spec.experiment_type,
            spec.dataset
        );

        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;
        for (index, item) in items.iter().enumerate() {
            if run.cancel.is_cancelled() {
                log::info!(
                    "experiment {}: cancelled after {}/{} items",
                    run.id,
                    index,
                    total
                );
                cancelled = true;
                break;
            }
            let outcome = self
                .engine
                .run_item(&run.id, spec, domain.as_ref(), index, item)
                .await;
            log::debug!(
                "experiment {}: item {}/{} {}",
                run.id,
                index + 1,
                total,
                if outcome.is_success() { "done" } else { "failed" }
            );
            run.observer
                .item_finished(outcome.clone(), index + 1, total)
                .await;
            outcomes.push(outcome);
        }

        let metrics = compute_metrics(spec, domain.as_ref(), &outcomes, total, cancelled);
        if cancelled {
            return RunOutcome::Cancelled(metrics);
        }
        if metrics.items_succeeded == 0 {
            let first_error = outcomes
                .iter()
                .find_map(|o| o.error.clone())
                .unwrap_or_else(|| "no items".to_string());
            return RunOutcome::Failed(format!(
                "no item was processed successfully ({} failed; first error: {})",
                metrics.items_failed, first_error
            ));
        }
        RunOutcome::Completed(metrics)
    }
}

/// Aggregate item outcomes into experiment metrics. Means are taken over successful items.
pub fn compute_metrics(
    spec: &ExperimentSpec,
    domain: &dyn DomainModule,
    outcomes: &[ItemOutcome],
    items_total: usize,
    cancelled: bool,
) -> ExperimentMetrics {
    let succeeded: Vec<&ItemOutcome> = outcomes.iter().filter(|o| o.is_success()).collect();
    let names = participant_names(spec);

    let mut metric_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut model_sums: BTreeMap<String, BTreeMap<String, (f64, usize)>> = BTreeMap::new();
    let mut verdict_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut no_consensus = 0usize;
    let mut agreement_known = 0usize;
    let mut agreed = 0usize;
    let mut labelled = 0usize;
    let mut correct = 0usize;

    for outcome in &succeeded {
        for (key, value) in &outcome.final_metrics {
            accumulate(metric_sums.entry(key.clone()).or_default(), *value);
        }

        let last_turn = outcome.turns.iter().map(|t| t.turn).max().unwrap_or(0);
        for turn in outcome.turns.iter().filter(|t| t.turn == last_turn) {
            let name = names
                .get(turn.participant)
                .cloned()
                .unwrap_or_else(|| turn.model.clone());
            let per_model = model_sums.entry(name).or_default();
            for (key, value) in &turn.parsed.metrics {
                accumulate(per_model.entry(key.clone()).or_default(), *value);
            }
        }

        if let Some(agree) = outcome.participants_agree {
            agreement_known += 1;
            if agree {
                agreed += 1;
            }
        }

        if let Some(verdict) = &outcome.final_verdict {
            *verdict_counts.entry(verdict.label().to_string()).or_insert(0) += 1;
            if *verdict == FinalVerdict::NoConsensus {
                no_consensus += 1;
            }
            if let Some(expected) = outcome.label.as_deref().and_then(|l| domain.normalize_label(l))
            {
                labelled += 1;
                if matches!(verdict, FinalVerdict::Verdict(v) if *v == expected) {
                    correct += 1;
                }
            }
        }
    }

    let is_consensus = spec.experiment_type == ExperimentType::Consensus;
    ExperimentMetrics {
        items_total,
        items_processed: outcomes.len(),
        items_succeeded: succeeded.len(),
        items_failed: outcomes.len() - succeeded.len(),
        metric_means: means(metric_sums),
        model_metrics: model_sums
            .into_iter()
            .map(|(model, sums)| (model, means(sums)))
            .collect(),
        verdict_counts,
        no_consensus_count: is_consensus.then_some(no_consensus),
        no_consensus_rate: is_consensus.then(|| ratio(no_consensus, succeeded.len())),
        accuracy: (labelled > 0).then(|| ratio(correct, labelled)),
        agreement_rate: (agreement_known > 0).then(|| ratio(agreed, agreement_known)),
        cancelled,
        duration_seconds: None,
    }
}

fn accumulate(slot: &mut (f64, usize), value: f64) {
    slot.0 += value;
    slot.1 += 1;
}

fn means(sums: BTreeMap<String, (f64, usize)>) -> BTreeMap<String, f64> {
    sums.into_iter()
        .filter(|(_, (_, n))| *n > 0)
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect()
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
