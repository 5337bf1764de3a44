use async_trait::async_trait;
use cloudllm_lab::dataset::WorkItem;
use cloudllm_lab::domain::{DomainModule, ParseError, ParsedResponse, Prompt, PromptRequest};
use cloudllm_lab::domains::field_format::FieldFormatDomain;
use cloudllm_lab::experiment::{
    AdversaryPolicy, ContextStrategy, DualVerdictSource, ExperimentSpec, ExperimentType,
    FinalVerdict, ItemStatus, TiePolicy,
};
use cloudllm_lab::protocol::ConversationEngine;
use cloudllm_lab::provider::{
    Completion, CompletionRequest, ModelProvider, ProviderError, ProviderRegistry, Role,
};
use std::sync::{Arc, Mutex};

type Script = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;

struct ScriptedProvider {
    calls: Mutex<Vec<CompletionRequest>>,
    respond: Box<Script>,
}

impl ScriptedProvider {
    fn new(
        respond: impl Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.respond)(&request).map(Completion::text)
    }
}

/// Reads `verdict=X` replies; used to produce arbitrary verdict labels.
struct VerdictDomain;

impl DomainModule for VerdictDomain {
    fn id(&self) -> &str {
        "verdicts"
    }

    fn build_prompt(&self, request: &PromptRequest<'_>) -> Prompt {
        Prompt {
            system: format!("turn {}", request.turn),
            user: request.item.text.clone(),
        }
    }

    fn parse_response(&self, raw: &str) -> Result<ParsedResponse, ParseError> {
        let verdict = raw
            .strip_prefix("verdict=")
            .ok_or_else(|| ParseError::new("missing verdict"))?;
        Ok(ParsedResponse {
            verdict: Some(verdict.to_string()),
            ..ParsedResponse::default()
        })
    }
}

fn user_message(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn system_message(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

const FAKE_NEWS_REPLY: &str = "Bias: 20\nManipulative Framing: 10\nAgreement Score: 75\n\
Reason: Sources check out.\nConfidence: 80\nClassification: 1\nReliability: 90";

fn engine_with(provider: Arc<ScriptedProvider>) -> ConversationEngine {
    let registry = ProviderRegistry::new().with_provider("mock", provider).unwrap();
    ConversationEngine::new(Arc::new(registry))
}

#[tokio::test]
async fn test_first_turn_only_injects_text_in_turn_one_prompts_only() {
    let provider = ScriptedProvider::new(|_| Ok(FAKE_NEWS_REPLY.to_string()));
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_context_strategy(ContextStrategy::FirstTurnOnly)
        .with_turn_limit(3);

    let items: Vec<WorkItem> = (0..10)
        .map(|i| WorkItem::new(i.to_string(), format!("<<article-{}>>", i)))
        .collect();
    for (i, item) in items.iter().enumerate() {
        let outcome = engine.run_item("exp", &spec, &domain, i, item).await;
        assert_eq!(outcome.status, ItemStatus::Completed);
        assert_eq!(outcome.turns.len(), 6);
        assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("1".into())));
    }

    let calls = provider.calls();
    assert_eq!(calls.len(), 60);
    for (i, item) in items.iter().enumerate() {
        let with_text: Vec<&CompletionRequest> = calls
            .iter()
            .filter(|c| user_message(c).contains(&item.text))
            .collect();
        assert_eq!(with_text.len(), 2, "item {} text should reach both turn-1 prompts", i);
        assert!(with_text
            .iter()
            .all(|c| user_message(c).starts_with("This is Round 1")));
    }
    assert!(calls
        .iter()
        .filter(|c| !user_message(c).starts_with("This is Round 1"))
        .all(|c| !user_message(c).contains("<<article-")));
}

#[tokio::test]
async fn test_first_and_last_turn_reinjects_on_final_turn() {
    let provider = ScriptedProvider::new(|_| Ok(FAKE_NEWS_REPLY.to_string()));
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_context_strategy(ContextStrategy::FirstAndLastTurn)
        .with_turn_limit(4);
    let item = WorkItem::new("x", "<<body>>");

    engine.run_item("exp", &spec, &domain, 0, &item).await;

    for call in provider.calls() {
        let user = user_message(&call);
        let injected = user.contains("<<body>>");
        let first_or_last =
            user.starts_with("This is Round 1") || user.starts_with("This is Round 4");
        assert_eq!(injected, first_or_last, "unexpected injection in: {}", user);
    }
}

#[tokio::test]
async fn test_later_turns_carry_the_transcript() {
    let provider = ScriptedProvider::new(|req| {
        Ok(format!("{}\nReason: said by {}", FAKE_NEWS_REPLY, req.model))
    });
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_turn_limit(2);

    engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    let round_two: Vec<CompletionRequest> = provider
        .calls()
        .into_iter()
        .filter(|c| user_message(c).starts_with("This is Round 2"))
        .collect();
    assert_eq!(round_two.len(), 2);
    for call in &round_two {
        assert!(user_message(call).contains("Conversation history:"));
        assert!(user_message(call).contains("(You)"));
        assert!(system_message(call).contains("final turn"));
    }
}

#[tokio::test]
async fn test_single_runs_exactly_one_turn() {
    let provider = ScriptedProvider::new(|_| Ok(FAKE_NEWS_REPLY.to_string()));
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("single", "fake_news", ExperimentType::Single, "ds")
        .with_model("mock")
        .with_turn_limit(5);

    let outcome = engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(provider.calls().len(), 1);
    assert_eq!(provider.calls()[0].model, "scripted");
    assert_eq!(outcome.turns.len(), 1);
    assert_eq!(outcome.final_metrics["reliability"], 90.0);
}

#[tokio::test]
async fn test_consensus_with_three_distinct_verdicts_is_no_consensus() {
    let provider = ScriptedProvider::new(|req| Ok(format!("verdict={}", req.model.to_uppercase())));
    let engine = engine_with(provider);
    let spec = ExperimentSpec::new("c", "verdicts", ExperimentType::Consensus, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_model("mock:c")
        .with_turn_limit(2);

    let outcome = engine
        .run_item("exp", &spec, &VerdictDomain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(outcome.status, ItemStatus::Completed);
    assert_eq!(outcome.turns.len(), 6);
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::NoConsensus));
}

#[tokio::test]
async fn test_consensus_majority_and_tie_policy() {
    let provider = ScriptedProvider::new(|req| Ok(format!("verdict={}", req.model.to_uppercase())));
    let engine = engine_with(provider);
    let item = WorkItem::new("x", "text");

    let majority = ExperimentSpec::new("c", "verdicts", ExperimentType::Consensus, "ds")
        .with_model("mock:a")
        .with_model("mock:c")
        .with_model("mock:a")
        .with_turn_limit(1);
    let outcome = engine
        .run_item("exp", &majority, &VerdictDomain, 0, &item)
        .await;
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("A".into())));

    let deferring = ExperimentSpec::new("c", "verdicts", ExperimentType::Consensus, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_model("mock:c")
        .with_turn_limit(1)
        .with_tie_policy(TiePolicy::DeferTo { participant: 1 });
    let outcome = engine
        .run_item("exp", &deferring, &VerdictDomain, 0, &item)
        .await;
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("B".into())));
}

#[tokio::test]
async fn test_provider_failure_marks_item_failed_and_keeps_turns() {
    let provider = ScriptedProvider::new(|req| {
        if req.model == "b" && user_message(req).starts_with("This is Round 2") {
            Err(ProviderError::fatal("boom"))
        } else {
            Ok(FAKE_NEWS_REPLY.to_string())
        }
    });
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_turn_limit(3);

    let outcome = engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(outcome.status, ItemStatus::ItemFailed);
    assert_eq!(outcome.turns.len(), 3);
    assert!(outcome.error.as_deref().unwrap().contains("boom"));
    assert!(outcome.final_verdict.is_none());
    // No third round was attempted.
    assert_eq!(provider.calls().len(), 4);
}

#[tokio::test]
async fn test_unparseable_reply_fails_the_item() {
    let provider = ScriptedProvider::new(|_| Ok("I'd rather not say.".to_string()));
    let engine = engine_with(provider);
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("single", "fake_news", ExperimentType::Single, "ds")
        .with_model("mock");

    let outcome = engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(outcome.status, ItemStatus::ItemFailed);
    assert!(outcome.turns.is_empty());
}

#[tokio::test]
async fn test_default_dual_adversary_is_second_participant() {
    let provider = ScriptedProvider::new(|_| Ok(FAKE_NEWS_REPLY.to_string()));
    let engine = engine_with(provider.clone());
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_turn_limit(3)
        .adversarial();

    let outcome = engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    let secret: Vec<CompletionRequest> = provider
        .calls()
        .into_iter()
        .filter(|c| system_message(c).contains("secret goal"))
        .collect();
    assert_eq!(secret.len(), 3);
    assert!(secret.iter().all(|c| c.model == "b"));
    assert!(outcome
        .turns
        .iter()
        .all(|t| t.is_adversary == (t.participant == 1)));
    // Adversarial runs ask everyone for interaction scores.
    assert!(provider
        .calls()
        .iter()
        .all(|c| system_message(c).contains("Influence Score:")));
}

#[tokio::test]
async fn test_random_adversary_is_stable_within_an_item() {
    let provider = ScriptedProvider::new(|_| Ok(FAKE_NEWS_REPLY.to_string()));
    let engine = engine_with(provider);
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("c", "fake_news", ExperimentType::Consensus, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_model("mock:c")
        .with_turn_limit(2)
        .with_adversary_policy(AdversaryPolicy::RandomPerItem { seed: 7 });

    for index in 0..5 {
        let outcome = engine
            .run_item("exp", &spec, &domain, index, &WorkItem::new("x", "text"))
            .await;
        let adversaries: Vec<usize> = outcome
            .turns
            .iter()
            .filter(|t| t.is_adversary)
            .map(|t| t.participant)
            .collect();
        assert_eq!(adversaries.len(), 2);
        assert_eq!(adversaries[0], adversaries[1]);
        assert_eq!(Some(adversaries[0]), spec.adversary_for_item(index));
    }
}

#[tokio::test]
async fn test_final_scores_are_recorded_per_participant() {
    let provider = ScriptedProvider::new(|req| {
        let agreement = if req.model == "a" { 40 } else { 60 };
        Ok(format!(
            "Agreement Score: {}\nInfluence Score: 30\nConfidence: 50\nClassification: 0",
            agreement
        ))
    });
    let engine = engine_with(provider);
    let domain = FieldFormatDomain::fake_news();
    let spec = ExperimentSpec::new("dual", "fake_news", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_turn_limit(2)
        .adversarial();

    let outcome = engine
        .run_item("exp", &spec, &domain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(outcome.agreement_scores["Model A (mock:a)"], 40.0);
    assert_eq!(outcome.agreement_scores["Model B (mock:b)"], 60.0);
    assert_eq!(outcome.influence_scores.len(), 2);
    assert_eq!(outcome.final_metrics["agreement_score"], 50.0);
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("0".into())));
}

#[tokio::test]
async fn test_adversarial_dual_records_the_cooperative_verdict() {
    let provider = ScriptedProvider::new(|req| {
        let verdict = if req.model == "a" { "real" } else { "fake" };
        Ok(format!("verdict={}", verdict))
    });
    let engine = engine_with(provider);
    let item = WorkItem::new("x", "text");
    let spec = ExperimentSpec::new("dual", "verdicts", ExperimentType::Dual, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_turn_limit(2)
        .adversarial();

    let outcome = engine.run_item("exp", &spec, &VerdictDomain, 0, &item).await;
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("real".into())));
    assert_eq!(outcome.participants_agree, Some(false));

    // Making A the adversary hands the verdict to B.
    let flipped = spec
        .clone()
        .with_adversary_policy(AdversaryPolicy::Fixed { participant: 0 });
    let outcome = engine.run_item("exp", &flipped, &VerdictDomain, 0, &item).await;
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("fake".into())));

    // An explicit source can still pick the adversary.
    let pinned = spec.with_dual_verdict(DualVerdictSource::Participant { participant: 1 });
    let outcome = engine.run_item("exp", &pinned, &VerdictDomain, 0, &item).await;
    assert_eq!(outcome.final_verdict, Some(FinalVerdict::Verdict("fake".into())));
}

#[tokio::test]
async fn test_matching_final_verdicts_count_as_agreement() {
    let provider = ScriptedProvider::new(|_| Ok("verdict=real".to_string()));
    let engine = engine_with(provider);
    let spec = ExperimentSpec::new("c", "verdicts", ExperimentType::Consensus, "ds")
        .with_model("mock:a")
        .with_model("mock:b")
        .with_model("mock:c")
        .with_turn_limit(1);

    let outcome = engine
        .run_item("exp", &spec, &VerdictDomain, 0, &WorkItem::new("x", "text"))
        .await;

    assert_eq!(outcome.participants_agree, Some(true));
}
