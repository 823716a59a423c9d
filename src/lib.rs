pub mod agent;
pub mod auth;
pub mod cases;
pub mod config;
pub mod conversation;
pub mod error;
pub mod eval;
pub mod partner;
pub mod providers;
pub mod report;
pub mod runner;
pub mod types;

pub use agent::{
    Activity, ActivityType, AgentError, AgentReply, ConversationalAgent, CopilotStudioClient,
    FoundryAgentClient, ProviderAgent,
};
pub use auth::{
    AccessToken, AuthError, ClientSecretCredential, StaticTokenCredential, TokenCredential,
};
pub use cases::{RecordedConversation, Scenario, TestCase};
pub use conversation::{
    ConversationDriver, ConversationPolicy, ConversationState, Opening, SessionOutcome, Speaker,
    Transcript, Turn,
};
pub use error::{HarnessError, LLMError};
pub use eval::{
    EvalError, EvaluationResult, Evaluator, JudgeMetric, LexicalMetric, Metric, MetricInput,
    MetricScore, ResultStatus, Rubric,
};
pub use partner::ConversationPartner;
pub use providers::LLMProvider;
pub use report::{EvalReport, ReportError, ReportFormat, ReportSummary};
pub use runner::EvalRunner;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
