//! Clients for the agent under test.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{auth::AuthError, config::ConfigError, LLMError};

pub mod copilot_studio;
pub mod foundry;
pub mod provider_agent;

pub use copilot_studio::CopilotStudioClient;
pub use foundry::FoundryAgentClient;
pub use provider_agent::ProviderAgent;

pub type ActivityStream = Pin<Box<dyn Stream<Item = Result<Activity, AgentError>> + Send>>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not obtain a token: {0}")]
    Auth(#[from] AuthError),
    #[error("malformed activity stream: {0}")]
    InvalidStream(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("agent run ended as {status}: {detail}")]
    RunFailed { status: String, detail: String },
    #[error("agent did not report a conversation id")]
    MissingConversationId,
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AgentError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    Message,
    Typing,
    Event,
    EndOfConversation,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationAccount {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Activity {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: ActivityType::Message,
            text: Some(text.into()),
            conversation: None,
            id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation = Some(ConversationAccount {
            id: conversation_id.into(),
        });
        self
    }
}

/// Everything the agent sent back for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub conversation_id: String,
    pub activities: Vec<Activity>,
}

impl AgentReply {
    /// Concatenated text of all message activities, trimmed.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for activity in &self.activities {
            if activity.kind == ActivityType::Message {
                if let Some(chunk) = &activity.text {
                    text.push_str(chunk);
                }
            }
        }
        text.trim().to_string()
    }

    pub fn ends_conversation(&self) -> bool {
        self.activities
            .iter()
            .any(|activity| activity.kind == ActivityType::EndOfConversation)
    }
}

#[async_trait]
pub trait ConversationalAgent: Send + Sync {
    /// Checks that the agent can be reached with the configured credentials
    /// before any case runs.
    async fn connect(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Opens a conversation. Greeting activities, if any, are returned with
    /// the new conversation id.
    async fn start_conversation(&self) -> Result<AgentReply, AgentError>;

    async fn ask(&self, conversation_id: &str, text: &str) -> Result<AgentReply, AgentError>;

    /// Releases whatever the client keeps for a finished conversation.
    async fn end_conversation(&self, _conversation_id: &str) {}

    fn name(&self) -> &str;
}
