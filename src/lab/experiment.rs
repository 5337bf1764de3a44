//! Experiment data model.
//!
//! An [`ExperimentSpec`] is the immutable description of what to run; an [`ExperimentState`]
//! is the mutable record the [`Scheduler`](crate::lab::scheduler::Scheduler) keeps for it.
//! Per-item results are [`ItemOutcome`]s made of ordered [`ConversationTurn`]s.
//!
//! ```
//! use cloudllm_lab::experiment::{ContextStrategy, ExperimentSpec, ExperimentType};
//!
//! let spec = ExperimentSpec::new("fn-dual", "fake_news", ExperimentType::Dual, "articles.csv")
//!     .with_model("openai:gpt-4o")
//!     .with_model("claude")
//!     .with_context_strategy(ContextStrategy::AllTurns)
//!     .with_turn_limit(3)
//!     .with_priority(2);
//!
//! assert!(spec.validate().is_ok());
//! assert_eq!(spec.participants().len(), 2);
//! ```

use crate::lab::domain::ParsedResponse;
use crate::lab::error::LabError;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a submitted experiment (a UUID v4 string).
pub type ExperimentId = String;

/// The conversational protocol an experiment runs for every work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    /// One model, one turn, no dialogue.
    Single,
    /// Two models exchange views for up to `turn_limit` turns.
    Dual,
    /// Three models seek a majority verdict.
    Consensus,
}

impl ExperimentType {
    /// The wire name (`single`, `dual`, `consensus`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentType::Single => "single",
            ExperimentType::Dual => "dual",
            ExperimentType::Consensus => "consensus",
        }
    }

    /// Number of models that take part in each turn.
    pub fn participant_count(&self) -> usize {
        match self {
            ExperimentType::Single => 1,
            ExperimentType::Dual => 2,
            ExperimentType::Consensus => 3,
        }
    }
}

impl fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentType {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "single" => Ok(ExperimentType::Single),
            "dual" => Ok(ExperimentType::Dual),
            "consensus" => Ok(ExperimentType::Consensus),
            other => Err(LabError::InvalidSpec(format!(
                "unknown experiment type '{}'",
                other
            ))),
        }
    }
}

/// Which turns receive the source text under analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Inject only at turn 1.
    #[default]
    FirstTurnOnly,
    /// Inject at every turn.
    AllTurns,
    /// Inject at turn 1 and at the final turn.
    FirstAndLastTurn,
}

impl ContextStrategy {
    /// The wire name (`first_turn_only`, `all_turns`, `first_and_last_turn`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStrategy::FirstTurnOnly => "first_turn_only",
            ContextStrategy::AllTurns => "all_turns",
            ContextStrategy::FirstAndLastTurn => "first_and_last_turn",
        }
    }

    /// Whether the source text is injected at 1-based `turn` of a `turn_limit`-turn exchange.
    ///
    /// ```
    /// use cloudllm_lab::experiment::ContextStrategy;
    ///
    /// let s = ContextStrategy::FirstAndLastTurn;
    /// assert!(s.injects_at(1, 4));
    /// assert!(!s.injects_at(2, 4));
    /// assert!(s.injects_at(4, 4));
    /// ```
    pub fn injects_at(&self, turn: usize, turn_limit: usize) -> bool {
        match self {
            ContextStrategy::FirstTurnOnly => turn == 1,
            ContextStrategy::AllTurns => true,
            ContextStrategy::FirstAndLastTurn => turn == 1 || turn == turn_limit,
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStrategy {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first_turn_only" => Ok(ContextStrategy::FirstTurnOnly),
            "all_turns" => Ok(ContextStrategy::AllTurns),
            "first_and_last_turn" => Ok(ContextStrategy::FirstAndLastTurn),
            other => Err(LabError::InvalidSpec(format!(
                "unknown context strategy '{}'",
                other
            ))),
        }
    }
}

/// A participating model: a provider id plus an optional provider-specific model id.
///
/// Written as `provider` or `provider:model`. When the model part is omitted the provider's
/// default model is used.
///
/// ```
/// use cloudllm_lab::experiment::ModelRef;
///
/// let m: ModelRef = "together:lgai/exaone-3-5-32b-instruct".parse().unwrap();
/// assert_eq!(m.provider, "together");
/// assert_eq!(m.model.as_deref(), Some("lgai/exaone-3-5-32b-instruct"));
/// assert_eq!(m.to_string(), "together:lgai/exaone-3-5-32b-instruct");
///
/// let bare: ModelRef = "claude".parse().unwrap();
/// assert!(bare.model.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelRef {
    /// Key into the [`ProviderRegistry`](crate::lab::provider::ProviderRegistry).
    pub provider: String,
    /// Model id passed to the provider, or `None` for the provider default.
    pub model: Option<String>,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: Some(model.into()),
        }
    }

    pub fn provider_default(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{}:{}", self.provider, model),
            None => f.write_str(&self.provider),
        }
    }
}

impl FromStr for ModelRef {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (provider, model) = match s.split_once(':') {
            Some((provider, model)) => (provider.trim(), Some(model.trim())),
            None => (s, None),
        };
        if provider.is_empty() {
            return Err(LabError::InvalidSpec(format!(
                "model reference '{}' has no provider",
                s
            )));
        }
        Ok(ModelRef {
            provider: provider.to_string(),
            model: model.filter(|m| !m.is_empty()).map(str::to_string),
        })
    }
}

impl TryFrom<String> for ModelRef {
    type Error = LabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelRef> for String {
    fn from(value: ModelRef) -> Self {
        value.to_string()
    }
}

/// How the adversarial participant is chosen when an experiment runs in adversarial mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdversaryPolicy {
    /// The participant at this index is the adversary for every item.
    Fixed { participant: usize },
    /// A participant is drawn per item from a generator seeded with `seed ^ item_index`,
    /// so reruns with the same seed pick the same adversaries.
    RandomPerItem { seed: u64 },
}

/// What a consensus experiment records when no verdict has a strict majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TiePolicy {
    /// Record [`FinalVerdict::NoConsensus`].
    #[default]
    NoConsensus,
    /// Adopt the final verdict of the participant at this index.
    DeferTo { participant: usize },
}

/// Whose final-turn verdict becomes a dual item's final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DualVerdictSource {
    /// The first participant that is not the item's adversary. Participant 0 when the run
    /// is cooperative.
    #[default]
    Cooperative,
    /// The participant at this index, adversary or not.
    Participant { participant: usize },
}

/// Immutable description of one experiment. Created at submission time and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Human-readable name.
    pub name: String,
    /// Key into the [`DomainRegistry`](crate::lab::domain::DomainRegistry).
    pub domain: String,
    pub experiment_type: ExperimentType,
    /// Participating models, in speaking order. Only the first
    /// [`participant_count`](ExperimentType::participant_count) are used.
    pub models: Vec<ModelRef>,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default)]
    pub adversarial: bool,
    /// Explicit adversary; must name one of the participants.
    #[serde(default)]
    pub adversary_model: Option<ModelRef>,
    #[serde(default)]
    pub adversary_policy: Option<AdversaryPolicy>,
    #[serde(default)]
    pub tie_policy: TiePolicy,
    #[serde(default)]
    pub dual_verdict: DualVerdictSource,
    pub temperature: f32,
    /// Maximum number of turns per item; forced to 1 for [`ExperimentType::Single`].
    pub turn_limit: usize,
    /// Reference handed to the [`DatasetSource`](crate::lab::dataset::DatasetSource).
    pub dataset: String,
    /// Process at most this many items.
    #[serde(default)]
    pub item_limit: Option<usize>,
    /// Lower runs sooner.
    pub priority: i32,
}

impl ExperimentSpec {
    /// Create a spec with no models and the stock defaults: temperature 0.7, three turns,
    /// priority 5, `first_turn_only`, cooperative.
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        experiment_type: ExperimentType,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            experiment_type,
            models: Vec::new(),
            context_strategy: ContextStrategy::FirstTurnOnly,
            adversarial: false,
            adversary_model: None,
            adversary_policy: None,
            tie_policy: TiePolicy::NoConsensus,
            dual_verdict: DualVerdictSource::Cooperative,
            temperature: 0.7,
            turn_limit: 3,
            dataset: dataset.into(),
            item_limit: None,
            priority: 5,
        }
    }

    /// Append a participating model given as `provider` or `provider:model`.
    ///
    /// An unparseable reference is kept as a bare provider id so that [`validate`](Self::validate)
    /// (and the runner) report it instead of the builder panicking.
    pub fn with_model(mut self, model: &str) -> Self {
        let parsed = model
            .parse()
            .unwrap_or_else(|_| ModelRef::provider_default(model.trim()));
        self.models.push(parsed);
        self
    }

    pub fn with_model_ref(mut self, model: ModelRef) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_context_strategy(mut self, strategy: ContextStrategy) -> Self {
        self.context_strategy = strategy;
        self
    }

    /// Enable adversarial mode using the default adversary for the experiment type.
    pub fn adversarial(mut self) -> Self {
        self.adversarial = true;
        self
    }

    /// Enable adversarial mode with an explicit adversary selection policy.
    pub fn with_adversary_policy(mut self, policy: AdversaryPolicy) -> Self {
        self.adversarial = true;
        self.adversary_policy = Some(policy);
        self
    }

    /// Enable adversarial mode with a named adversary.
    pub fn with_adversary_model(mut self, model: ModelRef) -> Self {
        self.adversarial = true;
        self.adversary_model = Some(model);
        self
    }

    pub fn with_tie_policy(mut self, policy: TiePolicy) -> Self {
        self.tie_policy = policy;
        self
    }

    pub fn with_dual_verdict(mut self, source: DualVerdictSource) -> Self {
        self.dual_verdict = source;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_turn_limit(mut self, turn_limit: usize) -> Self {
        self.turn_limit = turn_limit;
        self
    }

    pub fn with_item_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The turn limit actually run: always 1 for `single`.
    pub fn effective_turn_limit(&self) -> usize {
        match self.experiment_type {
            ExperimentType::Single => 1,
            _ => self.turn_limit,
        }
    }

    /// The models that speak, truncated to the experiment type's participant count.
    pub fn participants(&self) -> &[ModelRef] {
        let n = self.experiment_type.participant_count().min(self.models.len());
        &self.models[..n]
    }

    /// Reject structural problems the runner would otherwise hit mid-experiment.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.name.trim().is_empty() {
            return Err(LabError::InvalidSpec("name must not be empty".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(LabError::InvalidSpec("domain must not be empty".into()));
        }
        let needed = self.experiment_type.participant_count();
        if self.models.len() < needed {
            return Err(LabError::InvalidSpec(format!(
                "{} experiments need {} model(s), got {}",
                self.experiment_type,
                needed,
                self.models.len()
            )));
        }
        if let Some(bad) = self.models.iter().find(|m| m.provider.is_empty()) {
            return Err(LabError::InvalidSpec(format!(
                "model reference '{}' has no provider",
                bad
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(LabError::InvalidSpec(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.effective_turn_limit() == 0 {
            return Err(LabError::InvalidSpec("turn_limit must be at least 1".into()));
        }
        if self.item_limit == Some(0) {
            return Err(LabError::InvalidSpec("item_limit must be at least 1".into()));
        }
        if self.adversarial {
            if let Some(model) = &self.adversary_model {
                if !self.participants().contains(model) {
                    return Err(LabError::InvalidSpec(format!(
                        "adversary '{}' is not a participant",
                        model
                    )));
                }
            }
            if let Some(AdversaryPolicy::Fixed { participant }) = self.adversary_policy {
                if participant >= needed {
                    return Err(LabError::InvalidSpec(format!(
                        "adversary index {} out of range for {} participants",
                        participant, needed
                    )));
                }
            }
        }
        if let TiePolicy::DeferTo { participant } = self.tie_policy {
            if participant >= needed {
                return Err(LabError::InvalidSpec(format!(
                    "tie policy index {} out of range for {} participants",
                    participant, needed
                )));
            }
        }
        if let DualVerdictSource::Participant { participant } = self.dual_verdict {
            if self.experiment_type == ExperimentType::Dual && participant >= needed {
                return Err(LabError::InvalidSpec(format!(
                    "dual verdict index {} out of range for {} participants",
                    participant, needed
                )));
            }
        }
        Ok(())
    }

    /// Whether adversarial instructions are actually handed out. `single` runs ignore the
    /// flag since there is nobody to mislead.
    pub fn runs_adversarial(&self) -> bool {
        self.adversarial && self.experiment_type.participant_count() > 1
    }

    /// Index of the participant whose verdict a dual item records, given the item's
    /// adversary.
    ///
    /// ```
    /// use cloudllm_lab::experiment::{DualVerdictSource, ExperimentSpec, ExperimentType};
    ///
    /// let spec = ExperimentSpec::new("d", "fake_news", ExperimentType::Dual, "ds");
    /// assert_eq!(spec.dual_verdict_participant(Some(0)), 1);
    /// assert_eq!(spec.dual_verdict_participant(None), 0);
    ///
    /// let pinned = spec.with_dual_verdict(DualVerdictSource::Participant { participant: 1 });
    /// assert_eq!(pinned.dual_verdict_participant(Some(1)), 1);
    /// ```
    pub fn dual_verdict_participant(&self, adversary: Option<usize>) -> usize {
        match self.dual_verdict {
            DualVerdictSource::Cooperative => (0..self.experiment_type.participant_count())
                .find(|p| Some(*p) != adversary)
                .unwrap_or(0),
            DualVerdictSource::Participant { participant } => participant,
        }
    }

    /// Index of the adversarial participant for item `item_index`, if any.
    ///
    /// An explicit [`adversary_model`](Self::adversary_model) wins over the policy. Without
    /// either, dual experiments make the second participant the adversary and consensus
    /// experiments the first.
    pub fn adversary_for_item(&self, item_index: usize) -> Option<usize> {
        if !self.runs_adversarial() {
            return None;
        }
        let count = self.experiment_type.participant_count();
        if let Some(model) = &self.adversary_model {
            if let Some(pos) = self.participants().iter().position(|m| m == model) {
                return Some(pos);
            }
        }
        match self.adversary_policy {
            Some(AdversaryPolicy::Fixed { participant }) => Some(participant.min(count - 1)),
            Some(AdversaryPolicy::RandomPerItem { seed }) => {
                let mut rng = StdRng::seed_from_u64(seed ^ item_index as u64);
                Some(rng.gen_range(0..count))
            }
            None => match self.experiment_type {
                ExperimentType::Dual => Some(1),
                _ => Some(0),
            },
        }
    }
}

/// Lifecycle of an experiment. Serialized verbatim as the lowercase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Completed | ExperimentStatus::Failed | ExperimentStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ExperimentStatus::Pending | ExperimentStatus::Running)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model response within an item's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// 1-based turn number.
    pub turn: usize,
    /// Index of the speaking participant.
    pub participant: usize,
    /// The speaking model as `provider` or `provider:model`.
    pub model: String,
    pub is_adversary: bool,
    /// Raw text returned by the provider.
    pub response: String,
    pub parsed: ParsedResponse,
    pub timestamp: DateTime<Utc>,
}

/// The derived verdict for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum FinalVerdict {
    /// A concrete verdict label produced by the domain module.
    Verdict(String),
    /// Consensus experiments only: no label held a strict majority.
    NoConsensus,
    /// The deciding response carried no verdict.
    Undetermined,
}

impl FinalVerdict {
    /// Label used in verdict distributions: the verdict itself, `no_consensus` or
    /// `undetermined`.
    pub fn label(&self) -> &str {
        match self {
            FinalVerdict::Verdict(label) => label,
            FinalVerdict::NoConsensus => "no_consensus",
            FinalVerdict::Undetermined => "undetermined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    ItemFailed,
}

/// Outcome of running the protocol on one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_index: usize,
    pub item_id: String,
    pub status: ItemStatus,
    /// Every turn produced before completion or failure, in order.
    pub turns: Vec<ConversationTurn>,
    pub final_verdict: Option<FinalVerdict>,
    /// Numeric metrics of the final turn, averaged across participants.
    pub final_metrics: BTreeMap<String, f64>,
    /// `agreement_score` per participant model on the final turn.
    pub agreement_scores: BTreeMap<String, f64>,
    /// `influence_score` per participant model on the final turn.
    pub influence_scores: BTreeMap<String, f64>,
    /// Dual and consensus: whether every participant ended on the same verdict.
    #[serde(default)]
    pub participants_agree: Option<bool>,
    /// Ground-truth label carried by the dataset row, if any.
    pub label: Option<String>,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn failed(
        item_index: usize,
        item_id: impl Into<String>,
        turns: Vec<ConversationTurn>,
        label: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            item_index,
            item_id: item_id.into(),
            status: ItemStatus::ItemFailed,
            turns,
            final_verdict: None,
            final_metrics: BTreeMap::new(),
            agreement_scores: BTreeMap::new(),
            influence_scores: BTreeMap::new(),
            participants_agree: None,
            label,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Aggregate metrics over an experiment's item outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExperimentMetrics {
    /// Items selected for the run (after `item_limit`).
    pub items_total: usize,
    pub items_processed: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    /// Mean of each final-turn metric over successful items.
    pub metric_means: BTreeMap<String, f64>,
    /// Mean of each final-turn metric per participant model.
    pub model_metrics: BTreeMap<String, BTreeMap<String, f64>>,
    /// Count of final verdict labels over successful items.
    pub verdict_counts: BTreeMap<String, usize>,
    /// Consensus experiments only.
    pub no_consensus_count: Option<usize>,
    /// Consensus experiments only: `no_consensus_count / items_succeeded`.
    pub no_consensus_rate: Option<f64>,
    /// Fraction of labelled, successful items whose verdict matched the label.
    pub accuracy: Option<f64>,
    /// Dual and consensus: fraction of successful items whose participants ended on the same
    /// verdict.
    pub agreement_rate: Option<f64>,
    /// Whether the run stopped early because of cancellation.
    pub cancelled: bool,
    /// Wall-clock run time, filled in by the scheduler.
    pub duration_seconds: Option<f64>,
}

/// Mutable record of a submitted experiment, owned by the scheduler.
///
/// Callers only ever see clones of it (snapshots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub id: ExperimentId,
    pub batch_id: Option<String>,
    pub spec: ExperimentSpec,
    /// Effective priority (lower runs sooner).
    pub priority: i32,
    pub status: ExperimentStatus,
    /// 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of items selected once the dataset is loaded.
    pub items_total: Option<usize>,
    pub results: Vec<ItemOutcome>,
    pub metrics: Option<ExperimentMetrics>,
    pub error: Option<String>,
    /// Set by `cancel` on a running experiment until the runner acknowledges.
    pub cancel_requested: bool,
}

impl ExperimentState {
    pub(crate) fn new(
        id: ExperimentId,
        spec: ExperimentSpec,
        priority: i32,
        batch_id: Option<String>,
    ) -> Self {
        Self {
            id,
            batch_id,
            spec,
            priority,
            status: ExperimentStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            items_total: None,
            results: Vec::new(),
            metrics: None,
            error: None,
            cancel_requested: false,
        }
    }

    /// Seconds between start and completion, when both are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual() -> ExperimentSpec {
        ExperimentSpec::new("d", "fake_news", ExperimentType::Dual, "ds")
            .with_model("openai")
            .with_model("claude")
    }

    #[test]
    fn single_forces_one_turn() {
        let spec = ExperimentSpec::new("s", "fake_news", ExperimentType::Single, "ds")
            .with_model("openai")
            .with_turn_limit(5);
        assert_eq!(spec.effective_turn_limit(), 1);
    }

    #[test]
    fn validate_rejects_too_few_models() {
        let spec = ExperimentSpec::new("c", "fake_news", ExperimentType::Consensus, "ds")
            .with_model("openai")
            .with_model("claude");
        assert!(matches!(spec.validate(), Err(LabError::InvalidSpec(_))));
    }

    #[test]
    fn validate_rejects_unknown_adversary() {
        let spec = dual().with_adversary_model(ModelRef::provider_default("gemini"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn default_adversary_follows_type() {
        assert_eq!(dual().adversarial().adversary_for_item(0), Some(1));

        let consensus = ExperimentSpec::new("c", "fake_news", ExperimentType::Consensus, "ds")
            .with_model("openai")
            .with_model("claude")
            .with_model("gemini")
            .adversarial();
        assert_eq!(consensus.adversary_for_item(7), Some(0));
        assert_eq!(dual().adversary_for_item(0), None);
    }

    #[test]
    fn single_ignores_the_adversarial_flag() {
        let spec = ExperimentSpec::new("s", "fake_news", ExperimentType::Single, "ds")
            .with_model("openai")
            .adversarial();
        assert!(spec.validate().is_ok());
        assert!(!spec.runs_adversarial());
        assert_eq!(spec.adversary_for_item(0), None);
    }

    #[test]
    fn dual_verdict_skips_the_adversary() {
        let spec = dual().adversarial();
        assert_eq!(spec.dual_verdict_participant(spec.adversary_for_item(0)), 0);

        let flipped = dual().with_adversary_model(ModelRef::provider_default("openai"));
        assert_eq!(flipped.dual_verdict_participant(flipped.adversary_for_item(0)), 1);

        let out_of_range = dual().with_dual_verdict(DualVerdictSource::Participant { participant: 2 });
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn explicit_adversary_model_wins() {
        let spec = dual()
            .with_adversary_policy(AdversaryPolicy::Fixed { participant: 1 })
            .with_adversary_model(ModelRef::provider_default("openai"));
        assert_eq!(spec.adversary_for_item(3), Some(0));
    }

    #[test]
    fn random_adversary_is_reproducible() {
        let spec = ExperimentSpec::new("c", "fake_news", ExperimentType::Consensus, "ds")
            .with_model("a")
            .with_model("b")
            .with_model("c")
            .with_adversary_policy(AdversaryPolicy::RandomPerItem { seed: 99 });
        let first: Vec<_> = (0..20).map(|i| spec.adversary_for_item(i)).collect();
        let second: Vec<_> = (0..20).map(|i| spec.adversary_for_item(i)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|a| matches!(a, Some(i) if *i < 3)));
    }

    #[test]
    fn spec_round_trips_through_json_with_wire_names() {
        let spec = dual().with_context_strategy(ContextStrategy::FirstAndLastTurn);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["experiment_type"], "dual");
        assert_eq!(json["context_strategy"], "first_and_last_turn");
        assert_eq!(json["models"][0], "openai");
        let back: ExperimentSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(ExperimentStatus::Cancelled).unwrap(),
            "cancelled"
        );
        assert!(ExperimentStatus::Failed.is_terminal());
        assert!(!ExperimentStatus::Running.is_terminal());
    }
}
