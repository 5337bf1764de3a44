use async_trait::async_trait;
use cloudllm_lab::config::LabConfig;
use cloudllm_lab::dataset::{InMemoryDatasets, WorkItem};
use cloudllm_lab::domain::DomainRegistry;
use cloudllm_lab::experiment::{ExperimentSpec, ExperimentType, ItemOutcome};
use cloudllm_lab::protocol::ConversationEngine;
use cloudllm_lab::provider::{
    Completion, CompletionRequest, ModelProvider, ProviderError, ProviderRegistry,
};
use cloudllm_lab::runner::{
    ExperimentExecutor, ExperimentRun, ExperimentRunner, RunObserver, RunOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Answers every prompt with a real-news verdict. Prompts mentioning "poison" or carrying
/// adversarial instructions are refused.
struct MockProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request
            .messages
            .iter()
            .any(|m| m.content.contains("poison") || m.content.contains("secret goal"))
        {
            return Err(ProviderError::fatal("content filter tripped"));
        }
        Ok(Completion::text(
            "Bias: 10\nManipulative Framing: 5\nReliability: 88\nReason: Well sourced.\n\
             Confidence: 90\nClassification: 1",
        ))
    }
}

#[derive(Default)]
struct RecordingObserver {
    selected: Mutex<Option<usize>>,
    progress: Mutex<Vec<(usize, usize)>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

#[async_trait]
impl RunObserver for RecordingObserver {
    async fn items_selected(&self, total: usize) {
        *self.selected.lock().unwrap() = Some(total);
    }

    async fn item_finished(&self, _outcome: ItemOutcome, processed: usize, total: usize) {
        self.progress.lock().unwrap().push((processed, total));
        if let Some((after, token)) = &self.cancel_after {
            if processed == *after {
                token.cancel();
            }
        }
    }
}

fn runner_with(datasets: InMemoryDatasets) -> (ExperimentRunner, Arc<MockProvider>) {
    let provider = Arc::new(MockProvider {
        calls: AtomicUsize::new(0),
    });
    let registry = ProviderRegistry::new()
        .with_provider("mock", provider.clone())
        .unwrap();
    let runner = ExperimentRunner::new(
        ConversationEngine::new(Arc::new(registry)),
        Arc::new(DomainRegistry::with_builtin()),
        Arc::new(datasets),
    );
    (runner, provider)
}

fn articles(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(format!("a{}", i), format!("Article number {}", i)).with_label("real"))
        .collect()
}

fn single_spec(dataset: &str) -> ExperimentSpec {
    ExperimentSpec::new("single run", "fake_news", ExperimentType::Single, dataset)
        .with_model("mock")
}

fn run_for(spec: ExperimentSpec, observer: Arc<RecordingObserver>, cancel: CancellationToken) -> ExperimentRun {
    ExperimentRun {
        id: "exp-1".to_string(),
        spec: Arc::new(spec),
        cancel,
        observer,
    }
}

#[tokio::test]
async fn test_single_run_processes_every_item() {
    let mut items = articles(5);
    items[2].text = "poison pill".to_string();
    let (runner, _) = runner_with(InMemoryDatasets::new().with_dataset("news", items));
    let observer = Arc::new(RecordingObserver::default());

    let outcome = runner
        .execute(run_for(single_spec("news"), observer.clone(), CancellationToken::new()))
        .await;

    let RunOutcome::Completed(metrics) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(metrics.items_total, 5);
    assert_eq!(metrics.items_processed, 5);
    assert_eq!(metrics.items_succeeded, 4);
    assert_eq!(metrics.items_failed, 1);
    assert_eq!(metrics.verdict_counts["1"], 4);
    assert_eq!(metrics.accuracy, Some(1.0));
    assert_eq!(metrics.metric_means["reliability"], 88.0);
    assert!(!metrics.cancelled);

    assert_eq!(*observer.selected.lock().unwrap(), Some(5));
    let progress = observer.progress.lock().unwrap().clone();
    assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
}

#[tokio::test]
async fn test_cancellation_stops_between_items() {
    let (runner, provider) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(10)));
    let cancel = CancellationToken::new();
    let observer = Arc::new(RecordingObserver {
        cancel_after: Some((3, cancel.clone())),
        ..RecordingObserver::default()
    });

    let outcome = runner
        .execute(run_for(single_spec("news"), observer.clone(), cancel))
        .await;

    let RunOutcome::Cancelled(metrics) = outcome else {
        panic!("expected cancellation, got {:?}", outcome);
    };
    assert!(metrics.cancelled);
    assert_eq!(metrics.items_processed, 3);
    assert_eq!(metrics.items_total, 10);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    assert_eq!(observer.progress.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let (runner, provider) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(3)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = runner
        .execute(run_for(single_spec("news"), Arc::new(RecordingObserver::default()), cancel))
        .await;

    assert!(matches!(outcome, RunOutcome::Cancelled(_)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_item_limit_and_runner_cap() {
    let (runner, _) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(10)));
    let outcome = runner
        .execute(run_for(
            single_spec("news").with_item_limit(4),
            Arc::new(RecordingObserver::default()),
            CancellationToken::new(),
        ))
        .await;
    let RunOutcome::Completed(metrics) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(metrics.items_total, 4);

    let (runner, _) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(10)));
    let runner = runner.with_max_items(2);
    let outcome = runner
        .execute(run_for(
            single_spec("news").with_item_limit(4),
            Arc::new(RecordingObserver::default()),
            CancellationToken::new(),
        ))
        .await;
    let RunOutcome::Completed(metrics) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(metrics.items_total, 2);
}

#[tokio::test]
async fn test_runner_from_config_applies_the_item_cap() {
    let provider = Arc::new(MockProvider {
        calls: AtomicUsize::new(0),
    });
    let registry = ProviderRegistry::new()
        .with_provider("mock", provider.clone())
        .unwrap();
    let config = LabConfig::from_lookup(|key| {
        (key == "MAX_ITEMS_PER_EXPERIMENT").then(|| "3".to_string())
    })
    .unwrap();
    let runner = ExperimentRunner::from_config(
        &config,
        ConversationEngine::new(Arc::new(registry)),
        Arc::new(DomainRegistry::with_builtin()),
        Arc::new(InMemoryDatasets::new().with_dataset("news", articles(10))),
    );

    let outcome = runner
        .execute(run_for(
            single_spec("news"),
            Arc::new(RecordingObserver::default()),
            CancellationToken::new(),
        ))
        .await;

    let RunOutcome::Completed(metrics) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(metrics.items_total, 3);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_single_run_ignores_the_adversarial_flag() {
    let (runner, provider) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(3)));

    let outcome = runner
        .execute(run_for(
            single_spec("news").adversarial(),
            Arc::new(RecordingObserver::default()),
            CancellationToken::new(),
        ))
        .await;

    let RunOutcome::Completed(metrics) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(metrics.items_succeeded, 3);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_systemic_errors_fail_the_run() {
    let (runner, _) = runner_with(InMemoryDatasets::new().with_dataset("news", articles(2)));
    let observer = || Arc::new(RecordingObserver::default());

    let unknown_domain = ExperimentSpec::new("x", "horoscopes", ExperimentType::Single, "news")
        .with_model("mock");
    match runner
        .execute(run_for(unknown_domain, observer(), CancellationToken::new()))
        .await
    {
        RunOutcome::Failed(reason) => assert!(reason.contains("unknown domain module")),
        other => panic!("unexpected outcome {:?}", other),
    }

    match runner
        .execute(run_for(single_spec("missing"), observer(), CancellationToken::new()))
        .await
    {
        RunOutcome::Failed(reason) => assert!(reason.contains("missing")),
        other => panic!("unexpected outcome {:?}", other),
    }

    let unregistered = ExperimentSpec::new("x", "fake_news", ExperimentType::Single, "news")
        .with_model("nowhere:model");
    match runner
        .execute(run_for(unregistered, observer(), CancellationToken::new()))
        .await
    {
        RunOutcome::Failed(reason) => assert!(reason.contains("not registered")),
        other => panic!("unexpected outcome {:?}", other),
    }

    let dual_with_one_model =
        ExperimentSpec::new("x", "fake_news", ExperimentType::Dual, "news").with_model("mock");
    assert!(matches!(
        runner
            .execute(run_for(dual_with_one_model, observer(), CancellationToken::new()))
            .await,
        RunOutcome::Failed(_)
    ));
}

#[tokio::test]
async fn test_all_items_failing_fails_the_run() {
    let items = vec![
        WorkItem::new("1", "poison one"),
        WorkItem::new("2", "poison two"),
    ];
    let (runner, _) = runner_with(InMemoryDatasets::new().with_dataset("news", items));

    let outcome = runner
        .execute(run_for(
            single_spec("news"),
            Arc::new(RecordingObserver::default()),
            CancellationToken::new(),
        ))
        .await;

    match outcome {
        RunOutcome::Failed(reason) => {
            assert!(reason.contains("no item was processed successfully"));
            assert!(reason.contains("content filter tripped"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
