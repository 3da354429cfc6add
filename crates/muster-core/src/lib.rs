//! # Muster Core
//!
//! Shared foundation for the Muster agent runtime: configuration, the error
//! taxonomy, and the collaborator traits the scheduler core depends on but
//! does not implement (LLM executor, skill matcher, credential/state stores).

pub mod config;
pub mod error;
pub mod traits;

pub use config::MusterConfig;
pub use error::{MusterError, Result};
pub use traits::{
    CredentialStore, ExecutionKind, ExecutionOutcome, ExecutionRequest, ExecutionStatus, Executor,
    SkillMatcher, StateStore,
};
