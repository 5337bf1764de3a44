//! # CloudLLM Lab
//!
//! CloudLLM Lab coordinates experiments in which one, two or three Large Language Models
//! analyze a dataset of texts (news articles, essays, ...) under a configurable conversational
//! protocol, and records structured outcomes for every item.
//!
//! The crate is organised in layers, leaves first:
//!
//! * **Capabilities**: [`provider::ModelProvider`] implementations behind a
//!   [`provider::ProviderRegistry`] (OpenAI-compatible HTTP clients with per-provider rate
//!   limits and retries), [`domain::DomainModule`]s that write prompts and parse replies, and
//!   [`dataset::DatasetSource`]s that load work items.
//! * **Conversation protocol**: [`protocol::ConversationEngine`] runs the turn-by-turn
//!   exchange for one item: `single` (one model, one turn), `dual` (two models in dialogue)
//!   or `consensus` (three models voting), optionally with an adversarial participant.
//! * **Experiment runner**: [`runner::ExperimentRunner`] drives the protocol over a whole
//!   dataset, honours cooperative cancellation between items and aggregates metrics.
//! * **Scheduler**: [`Scheduler`] admits experiments into a bounded number of concurrent
//!   slots in priority order and owns every experiment's lifecycle.
//! * **Batches**: [`BatchCoordinator`] submits named groups of experiments and derives their
//!   aggregate status from the scheduler.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cloudllm_lab::dataset::InMemoryDatasets;
//! use cloudllm_lab::domain::DomainRegistry;
//! use cloudllm_lab::experiment::{ContextStrategy, ExperimentSpec, ExperimentType};
//! use cloudllm_lab::protocol::ConversationEngine;
//! use cloudllm_lab::provider::ProviderRegistry;
//! use cloudllm_lab::runner::ExperimentRunner;
//! use cloudllm_lab::{BatchCoordinator, LabConfig, Scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     cloudllm_lab::init_logger();
//!
//!     let config = LabConfig::from_env()?;
//!     let datasets = Arc::new(InMemoryDatasets::new());
//!     datasets.insert_csv("news", "id,title,text,label\n1,Headline,Body text,real\n")?;
//!
//!     let engine = ConversationEngine::new(Arc::new(ProviderRegistry::from_config(&config)));
//!     let runner = ExperimentRunner::from_config(
//!         &config,
//!         engine,
//!         Arc::new(DomainRegistry::with_builtin()),
//!         datasets,
//!     );
//!     let scheduler = Scheduler::new(&config, Arc::new(runner))?;
//!     scheduler.start_processing().await;
//!
//!     let batches = BatchCoordinator::new(scheduler.clone());
//!     let dual = config
//!         .spec("dual", "fake_news", ExperimentType::Dual, "news")
//!         .with_model("openai")
//!         .with_model("together")
//!         .with_context_strategy(ContextStrategy::AllTurns);
//!     let consensus = ExperimentSpec::new("consensus", "fake_news", ExperimentType::Consensus, "news")
//!         .with_model("openai")
//!         .with_model("together")
//!         .with_model("deepseek")
//!         .adversarial();
//!     let batch_id = batches.submit_batch("news study", "", vec![dual, consensus]).await?;
//!
//!     scheduler.wait_until_idle().await;
//!     println!("{:?}", batches.get_batch_status(&batch_id)?.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Everything logs through the `log` facade. Call [`init_logger`] once to install
//! `env_logger`, then control verbosity with `RUST_LOG` (e.g. `RUST_LOG=cloudllm_lab=debug`).
//! For structured hooks implement [`event::EventHandler`], or use
//! [`event::LoggingEventHandler`].

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global `env_logger` backend. Safe to call more than once.
///
/// ```rust
/// cloudllm_lab::init_logger();
/// cloudllm_lab::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::try_init();
    });
}

// Import the top-level `lab` module.
pub mod lab;

// Re-exporting key items for easier external access.
pub use lab::batch;
pub use lab::config;
pub use lab::dataset;
pub use lab::domain;
pub use lab::domains;
pub use lab::error;
pub use lab::event;
pub use lab::experiment;
pub use lab::protocol;
pub use lab::provider;
pub use lab::providers;
pub use lab::runner;
pub use lab::scheduler;

pub use lab::batch::{BatchCoordinator, BatchPhase, BatchStatus};
pub use lab::config::{LabConfig, ProviderSettings};
pub use lab::error::LabError;
pub use lab::event::{EventHandler, ExperimentEvent, LoggingEventHandler, ProtocolEvent};
pub use lab::experiment::{
    ContextStrategy, ExperimentSpec, ExperimentState, ExperimentStatus, ExperimentType, ModelRef,
};
pub use lab::scheduler::{ProcessingState, QueueMetrics, Scheduler};
