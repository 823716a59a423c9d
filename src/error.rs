use thiserror::Error;

use crate::{
    agent::AgentError, auth::AuthError, cases::CaseError, config::ConfigError, eval::EvalError,
    report::ReportError,
};

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("no more scripted responses")]
    ScriptExhausted,
}

/// Top-level failure of a harness run. Anything that reaches this type aborts
/// the run; per-case failures are recorded in the report instead.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("target agent unavailable: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Cases(#[from] CaseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Provider(#[from] LLMError),
}

impl HarnessError {
    /// Configuration and identity problems are reported with a distinct exit
    /// status so CI can tell them apart from failing evaluations.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Auth(_)
                | Self::Agent(AgentError::Auth(_) | AgentError::Config(_))
        )
    }
}
