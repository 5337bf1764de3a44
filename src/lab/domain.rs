//! Domain modules: prompt construction and response parsing for one analysis task.
//!
//! The conversation engine knows nothing about fake news or AI-text detection. For each
//! participant and turn it hands a [`PromptRequest`] to the experiment's [`DomainModule`],
//! sends the resulting [`Prompt`] to the model, and feeds the raw reply back through
//! [`DomainModule::parse_response`].

use crate::lab::dataset::WorkItem;
use crate::lab::domains::field_format::FieldFormatDomain;
use crate::lab::error::LabError;
use crate::lab::experiment::{ConversationTurn, ExperimentType};
use crate::lab::provider::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Everything a domain module needs to write one participant's prompt for one turn.
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub item: &'a WorkItem,
    pub experiment_type: ExperimentType,
    /// 1-based.
    pub turn: usize,
    pub turn_limit: usize,
    /// Whether the item text goes into this turn's prompt.
    pub inject_context: bool,
    /// Index of the participant being prompted.
    pub participant: usize,
    /// Display names of every participant, in speaking order.
    pub participant_names: &'a [String],
    /// Whether this participant receives the adversarial instructions.
    pub is_adversary: bool,
    /// Whether the experiment runs in adversarial mode at all.
    pub adversarial: bool,
    /// Every turn recorded so far for this item.
    pub transcript: &'a [ConversationTurn],
}

impl PromptRequest<'_> {
    pub fn is_final_turn(&self) -> bool {
        self.turn >= self.turn_limit
    }

    /// Display names of everyone except the participant being prompted.
    pub fn partner_names(&self) -> Vec<&str> {
        self.participant_names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.participant)
            .map(|(_, n)| n.as_str())
            .collect()
    }
}

/// System and user message for one model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

/// Structured reading of one model response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Domain verdict label, `None` when the response carried no valid one.
    pub verdict: Option<String>,
    /// Numeric scores keyed by snake_case field name.
    pub metrics: BTreeMap<String, f64>,
    /// Free-text fields (e.g. `reason`).
    pub fields: BTreeMap<String, String>,
}

/// A response the domain module could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Could not parse model response: {}", self.message)
    }
}

impl Error for ParseError {}

/// Prompt templates and parsing rules for one analysis task.
pub trait DomainModule: Send + Sync {
    /// Registry key, e.g. `"fake_news"`.
    fn id(&self) -> &str;

    fn build_prompt(&self, request: &PromptRequest<'_>) -> Prompt;

    fn parse_response(&self, raw: &str) -> Result<ParsedResponse, ParseError>;

    /// Map a dataset ground-truth label onto this domain's verdict labels, so accuracy can
    /// be computed. Returns `None` when the label means nothing to the domain.
    fn normalize_label(&self, label: &str) -> Option<String> {
        let label = label.trim();
        if label.is_empty() {
            None
        } else {
            Some(label.to_string())
        }
    }
}

/// Domain modules keyed by id.
#[derive(Default, Clone)]
pub struct DomainRegistry {
    modules: HashMap<String, Arc<dyn DomainModule>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the stock `fake_news` and `ai_text_detection` modules.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for module in [FieldFormatDomain::fake_news(), FieldFormatDomain::ai_text_detection()] {
            registry
                .modules
                .insert(module.id().to_string(), Arc::new(module));
        }
        registry
    }

    pub fn register(&mut self, module: Arc<dyn DomainModule>) -> Result<(), LabError> {
        let id = module.id().to_string();
        if self.modules.contains_key(&id) {
            return Err(LabError::DuplicateRegistration { kind: "domain", id });
        }
        self.modules.insert(id, module);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DomainModule>> {
        self.modules.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("modules", &self.ids())
            .finish()
    }
}
