//! The conversation protocol: the turn-by-turn exchange for one work item.
//!
//! For every item the [`ConversationEngine`] walks `INIT -> TURN(1..=n) -> FINALIZE`:
//!
//! ```text
//! INIT        pick the adversary (if any), name the participants
//! TURN(n)     every participant answers concurrently from the same transcript snapshot;
//!             each reply is parsed by the domain module and appended to the transcript
//! FINALIZE    derive the final verdict and the final-turn metrics
//! ```
//!
//! The final verdict of a `dual` item comes from the participant picked by the spec's
//! [`DualVerdictSource`](crate::lab::experiment::DualVerdictSource), which by default is the
//! cooperative one. Whether both sides ended on the same label is kept separately in
//! [`ItemOutcome::participants_agree`].
//!
//! `single` experiments are the degenerate case with one participant and one turn. Turns are
//! strictly sequential because each one reads the transcript of the previous ones.
//!
//! A provider or parse failure (after the provider's own retries) stops the item: the outcome
//! is marked [`ItemStatus::ItemFailed`] with the turns recorded so far, and the caller moves on.

use crate::lab::dataset::WorkItem;
use crate::lab::domain::{DomainModule, PromptRequest};
use crate::lab::event::{EventHandler, ProtocolEvent};
use crate::lab::experiment::{
    ConversationTurn, ExperimentSpec, ExperimentType, FinalVerdict, ItemOutcome, ItemStatus,
    TiePolicy,
};
use crate::lab::provider::ProviderRegistry;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs the protocol for single items.
#[derive(Clone)]
pub struct ConversationEngine {
    providers: Arc<ProviderRegistry>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ConversationEngine {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    async fn emit(&self, event: ProtocolEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_protocol_event(&event).await;
        }
    }

    /// Run every turn for `item` and derive its outcome. Never fails: errors become an
    /// `item_failed` outcome.
    pub async fn run_item(
        &self,
        experiment_id: &str,
        spec: &ExperimentSpec,
        domain: &dyn DomainModule,
        item_index: usize,
        item: &WorkItem,
    ) -> ItemOutcome {
        self.emit(ProtocolEvent::ItemStarted {
            experiment_id: experiment_id.to_string(),
            item_index,
            item_id: item.id.clone(),
        })
        .await;

        let participants = spec.participants();
        let names = participant_names(spec);
        let adversary = spec.adversary_for_item(item_index);
        let turn_limit = spec.effective_turn_limit();
        let mut transcript: Vec<ConversationTurn> = Vec::new();

        for turn in 1..=turn_limit {
            let inject_context = spec.context_strategy.injects_at(turn, turn_limit);

            let calls = participants.iter().enumerate().map(|(participant, model)| {
                let request = PromptRequest {
                    item,
                    experiment_type: spec.experiment_type,
                    turn,
                    turn_limit,
                    inject_context,
                    participant,
                    participant_names: &names,
                    is_adversary: adversary == Some(participant),
                    adversarial: spec.runs_adversarial(),
                    transcript: &transcript,
                };
                let messages = domain.build_prompt(&request).into_messages();
                async move {
                    self.providers
                        .call_model(model, messages, spec.temperature)
                        .await
                }
            });
            let replies = join_all(calls).await;

            let mut failure: Option<String> = None;
            for (participant, reply) in replies.into_iter().enumerate() {
                let model = &participants[participant];
                let response = match reply {
                    Ok(text) => text,
                    Err(e) => {
                        failure.get_or_insert_with(|| {
                            format!("turn {}: {} call failed: {}", turn, model, e)
                        });
                        continue;
                    }
                };
                let parsed = match domain.parse_response(&response) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        failure.get_or_insert_with(|| format!("turn {}: {}: {}", turn, model, e));
                        continue;
                    }
                };

                let is_adversary = adversary == Some(participant);
                self.emit(ProtocolEvent::TurnCompleted {
                    experiment_id: experiment_id.to_string(),
                    item_index,
                    turn,
                    participant,
                    model: model.to_string(),
                    is_adversary,
                    response_length: response.len(),
                    verdict: parsed.verdict.clone(),
                })
                .await;

                transcript.push(ConversationTurn {
                    turn,
                    participant,
                    model: model.to_string(),
                    is_adversary,
                    response,
                    parsed,
                    timestamp: Utc::now(),
                });
            }

            if let Some(error) = failure {
                log::warn!(
                    "experiment {}: item {} ({}) failed: {}",
                    experiment_id,
                    item_index,
                    item.id,
                    error
                );
                self.emit(ProtocolEvent::ItemFailed {
                    experiment_id: experiment_id.to_string(),
                    item_index,
                    turns: turn,
                    error: error.clone(),
                })
                .await;
                return ItemOutcome::failed(
                    item_index,
                    item.id.clone(),
                    transcript,
                    item.label.clone(),
                    error,
                );
            }
        }

        let outcome = finalize(spec, item_index, item, &names, adversary, transcript);
        if let Some(verdict) = &outcome.final_verdict {
            self.emit(ProtocolEvent::ItemCompleted {
                experiment_id: experiment_id.to_string(),
                item_index,
                turns: turn_limit,
                verdict: verdict.clone(),
            })
            .await;
        }
        outcome
    }
}

/// Display names used in prompts and in per-participant score maps: `Model A (openai:gpt-4o)`.
pub fn participant_names(spec: &ExperimentSpec) -> Vec<String> {
    spec.participants()
        .iter()
        .enumerate()
        .map(|(i, model)| {
            let letter = (b'A' + (i % 26) as u8) as char;
            format!("Model {} ({})", letter, model)
        })
        .collect()
}

fn finalize(
    spec: &ExperimentSpec,
    item_index: usize,
    item: &WorkItem,
    names: &[String],
    adversary: Option<usize>,
    transcript: Vec<ConversationTurn>,
) -> ItemOutcome {
    let last_turn = transcript.iter().map(|t| t.turn).max().unwrap_or(0);
    let final_turns: Vec<&ConversationTurn> =
        transcript.iter().filter(|t| t.turn == last_turn).collect();

    let final_verdict = match spec.experiment_type {
        ExperimentType::Consensus => {
            let verdicts: Vec<Option<String>> = final_turns
                .iter()
                .map(|t| t.parsed.verdict.clone())
                .collect();
            consensus_verdict(&verdicts, spec.tie_policy)
        }
        ExperimentType::Single => verdict_of(&final_turns, 0),
        ExperimentType::Dual => verdict_of(&final_turns, spec.dual_verdict_participant(adversary)),
    };
    let participants_agree = (spec.experiment_type != ExperimentType::Single)
        .then(|| unanimous(&final_turns))
        .flatten();

    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut agreement_scores = BTreeMap::new();
    let mut influence_scores = BTreeMap::new();
    for turn in &final_turns {
        for (key, value) in &turn.parsed.metrics {
            let entry = sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        let name = names
            .get(turn.participant)
            .cloned()
            .unwrap_or_else(|| turn.model.clone());
        if let Some(score) = turn.parsed.metrics.get("agreement_score") {
            agreement_scores.insert(name.clone(), *score);
        }
        if let Some(score) = turn.parsed.metrics.get("influence_score") {
            influence_scores.insert(name, *score);
        }
    }
    let final_metrics = sums
        .into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect();

    ItemOutcome {
        item_index,
        item_id: item.id.clone(),
        status: ItemStatus::Completed,
        turns: transcript,
        final_verdict: Some(final_verdict),
        final_metrics,
        agreement_scores,
        influence_scores,
        participants_agree,
        label: item.label.clone(),
        error: None,
    }
}

fn verdict_of(final_turns: &[&ConversationTurn], participant: usize) -> FinalVerdict {
    final_turns
        .iter()
        .find(|t| t.participant == participant)
        .and_then(|t| t.parsed.verdict.clone())
        .map(FinalVerdict::Verdict)
        .unwrap_or(FinalVerdict::Undetermined)
}

/// `None` when some participant gave no verdict.
fn unanimous(final_turns: &[&ConversationTurn]) -> Option<bool> {
    let verdicts: Option<Vec<&String>> = final_turns
        .iter()
        .map(|t| t.parsed.verdict.as_ref())
        .collect();
    let verdicts = verdicts?;
    let first = verdicts.first()?;
    Some(verdicts.iter().all(|v| v == first))
}

/// Majority vote over the participants' final verdicts.
///
/// A label wins when held by more than half of the participants. Otherwise the tie policy
/// decides: [`TiePolicy::NoConsensus`] records [`FinalVerdict::NoConsensus`],
/// [`TiePolicy::DeferTo`] adopts that participant's verdict. When nobody produced a verdict
/// the result is [`FinalVerdict::Undetermined`].
///
/// ```
/// use cloudllm_lab::experiment::{FinalVerdict, TiePolicy};
/// use cloudllm_lab::protocol::consensus_verdict;
///
/// let split = vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string())];
/// assert_eq!(consensus_verdict(&split, TiePolicy::NoConsensus), FinalVerdict::NoConsensus);
///
/// let two_of_three = vec![Some("1".to_string()), Some("0".to_string()), Some("1".to_string())];
/// assert_eq!(
///     consensus_verdict(&two_of_three, TiePolicy::NoConsensus),
///     FinalVerdict::Verdict("1".to_string())
/// );
/// ```
pub fn consensus_verdict(verdicts: &[Option<String>], tie: TiePolicy) -> FinalVerdict {
    if verdicts.iter().all(Option::is_none) {
        return FinalVerdict::Undetermined;
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for verdict in verdicts.iter().flatten() {
        *counts.entry(verdict.as_str()).or_insert(0) += 1;
    }
    if let Some((label, _)) = counts
        .iter()
        .find(|(_, count)| **count * 2 > verdicts.len())
    {
        return FinalVerdict::Verdict(label.to_string());
    }

    match tie {
        TiePolicy::NoConsensus => FinalVerdict::NoConsensus,
        TiePolicy::DeferTo { participant } => verdicts
            .get(participant)
            .cloned()
            .flatten()
            .map(FinalVerdict::Verdict)
            .unwrap_or(FinalVerdict::NoConsensus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(labels: &[Option<&str>]) -> Vec<Option<String>> {
        labels.iter().map(|l| l.map(str::to_string)).collect()
    }

    #[test]
    fn majority_needs_more_than_half() {
        assert_eq!(
            consensus_verdict(&v(&[Some("1"), None, Some("1")]), TiePolicy::NoConsensus),
            FinalVerdict::Verdict("1".into())
        );
        assert_eq!(
            consensus_verdict(&v(&[Some("1"), None, Some("0")]), TiePolicy::NoConsensus),
            FinalVerdict::NoConsensus
        );
    }

    #[test]
    fn defer_to_adopts_the_chosen_participant() {
        let split = v(&[Some("A"), Some("B"), Some("C")]);
        assert_eq!(
            consensus_verdict(&split, TiePolicy::DeferTo { participant: 2 }),
            FinalVerdict::Verdict("C".into())
        );
        let missing = v(&[Some("A"), Some("B"), None]);
        assert_eq!(
            consensus_verdict(&missing, TiePolicy::DeferTo { participant: 2 }),
            FinalVerdict::NoConsensus
        );
    }

    #[test]
    fn no_verdicts_is_undetermined() {
        assert_eq!(
            consensus_verdict(&v(&[None, None, None]), TiePolicy::NoConsensus),
            FinalVerdict::Undetermined
        );
    }

    #[test]
    fn names_are_lettered() {
        let spec = ExperimentSpec::new("d", "fake_news", ExperimentType::Dual, "ds")
            .with_model("openai:gpt-4o")
            .with_model("claude");
        assert_eq!(
            participant_names(&spec),
            vec!["Model A (openai:gpt-4o)", "Model B (claude)"]
        );
    }
}
