// src/lab/mod.rs

pub mod batch;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod domains;
pub mod error;
pub mod event;
pub mod experiment;
pub mod protocol;
pub mod provider;
pub mod providers;
pub mod runner;
pub mod scheduler;

// Export the main entry points so they can be reached as lab::Scheduler etc.
pub use batch::BatchCoordinator;
pub use config::LabConfig;
pub use error::LabError;
pub use scheduler::Scheduler;
