//! Errors surfaced by the scheduler, the batch coordinator and the registries.
//!
//! Item-level and experiment-level failures are *not* represented here: those are recorded
//! as data on [`ItemOutcome`](crate::lab::experiment::ItemOutcome) and
//! [`ExperimentState`](crate::lab::experiment::ExperimentState) so they remain inspectable
//! after the fact. `LabError` covers the conditions reported straight back to a caller.

use std::error::Error;
use std::fmt;

/// Errors returned by [`Scheduler`](crate::lab::scheduler::Scheduler),
/// [`BatchCoordinator`](crate::lab::batch::BatchCoordinator) and the capability registries.
///
/// # Examples
///
/// ```
/// use cloudllm_lab::LabError;
///
/// let err = LabError::ExperimentNotFound("exp-42".into());
/// assert_eq!(err.to_string(), "Experiment not found: exp-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabError {
    /// The referenced experiment id was never submitted to this scheduler.
    ExperimentNotFound(String),

    /// The referenced batch id is unknown (never created, or explicitly deleted).
    BatchNotFound(String),

    /// A batch was submitted without any experiment specifications.
    EmptyBatch,

    /// An [`ExperimentSpec`](crate::lab::experiment::ExperimentSpec) is structurally invalid.
    InvalidSpec(String),

    /// A domain module or provider was registered twice under the same id.
    DuplicateRegistration {
        /// `"domain"` or `"provider"`.
        kind: &'static str,
        /// The identifier that collided.
        id: String,
    },

    /// A configuration value could not be parsed or is out of range.
    Config(String),
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabError::ExperimentNotFound(id) => write!(f, "Experiment not found: {}", id),
            LabError::BatchNotFound(id) => write!(f, "Batch not found: {}", id),
            LabError::EmptyBatch => write!(f, "Batch contains no experiments"),
            LabError::InvalidSpec(msg) => write!(f, "Invalid experiment spec: {}", msg),
            LabError::DuplicateRegistration { kind, id } => {
                write!(f, "A {} with id '{}' is already registered", kind, id)
            }
            LabError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for LabError {}
