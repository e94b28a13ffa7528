//! pooldeploy core library — domain types, configuration provider, errors.
//!
//! Public API surface:
//! - [`types`] — change records, application specs, deployment operations
//! - [`error`] — [`ConfigError`]
//! - [`config`] — load / validate the YAML configuration
//! - [`pattern`] — case-insensitive wildcard matching for exclude patterns

pub mod config;
pub mod error;
pub mod pattern;
pub mod types;

pub use config::{Config, PoolCommands, PoolSettings, Settings};
pub use error::ConfigError;
pub use pattern::ExcludeSet;
pub use types::{
    ApplicationName, ApplicationSpec, ChangeKind, ChangeRecord, DeploymentOperation,
    DeploymentStep, FileOutcome, OperationStatus, PoolState, StepKind, StepStatus,
};
