//! Agents hosted in an Azure AI Foundry project (Agent Service REST API).
//!
//! A conversation is a thread. Every question appends a user message, starts
//! a run of the agent on the thread and polls the run until it settles; the
//! reply is the assistant text that run produced.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::time::{sleep, Instant};

use crate::{
    agent::{Activity, AgentError, AgentReply, ConversationalAgent},
    auth::TokenCredential,
    config::FoundrySettings,
};

#[derive(Debug, Deserialize)]
struct Thread {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

impl ThreadMessage {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_ref().map(|text| text.value.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct FoundryAgentClient {
    client: Client,
    endpoint: String,
    agent_id: String,
    api_version: String,
    poll_interval: Duration,
    run_timeout: Duration,
    credential: Arc<dyn TokenCredential>,
}

impl fmt::Debug for FoundryAgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoundryAgentClient")
            .field("endpoint", &self.endpoint)
            .field("agent_id", &self.agent_id)
            .field("api_version", &self.api_version)
            .field("credential", &self.credential.kind())
            .finish()
    }
}

impl FoundryAgentClient {
    pub fn new(
        settings: &FoundrySettings,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: settings.project_endpoint.trim_end_matches('/').to_string(),
            agent_id: settings.agent_id.clone(),
            api_version: settings.api_version.clone(),
            poll_interval: settings.poll_interval,
            run_timeout: settings.run_timeout,
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}?api-version={}",
            self.endpoint,
            path.trim_start_matches('/'),
            self.api_version
        )
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, AgentError> {
        let token = self.credential.token().await?;
        let response = builder.bearer_auth(token.secret()).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    async fn wait_for(&self, thread_id: &str, mut run: Run) -> Result<Run, AgentError> {
        let deadline = Instant::now() + self.run_timeout;
        while matches!(run.status.as_str(), "queued" | "in_progress" | "cancelling") {
            if Instant::now() >= deadline {
                return Err(AgentError::RunFailed {
                    status: run.status,
                    detail: format!("no result after {:?}", self.run_timeout),
                });
            }
            sleep(self.poll_interval).await;
            let url = self.url(&format!("threads/{thread_id}/runs/{}", run.id));
            run = self.send(self.client.get(url)).await?;
            tracing::trace!(run_id = %run.id, status = %run.status, "polled run");
        }
        Ok(run)
    }

    async fn run_text(&self, thread_id: &str, run_id: &str) -> Result<String, AgentError> {
        let url = format!(
            "{}&order=asc&run_id={run_id}",
            self.url(&format!("threads/{thread_id}/messages"))
        );
        let messages: MessageList = self.send(self.client.get(url)).await?;

        Ok(messages
            .data
            .iter()
            .filter(|message| message.role == "assistant")
            .filter(|message| message.run_id.as_deref() == Some(run_id))
            .map(ThreadMessage::text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl ConversationalAgent for FoundryAgentClient {
    async fn connect(&self) -> Result<(), AgentError> {
        self.credential.token().await?;
        Ok(())
    }

    async fn start_conversation(&self) -> Result<AgentReply, AgentError> {
        let thread: Thread = self
            .send(self.client.post(self.url("threads")).json(&json!({})))
            .await?;
        tracing::debug!(thread_id = %thread.id, "thread created");

        Ok(AgentReply {
            conversation_id: thread.id,
            activities: Vec::new(),
        })
    }

    async fn ask(&self, conversation_id: &str, text: &str) -> Result<AgentReply, AgentError> {
        let messages_url = self.url(&format!("threads/{conversation_id}/messages"));
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(messages_url)
                    .json(&json!({ "role": "user", "content": text })),
            )
            .await?;

        let runs_url = self.url(&format!("threads/{conversation_id}/runs"));
        let run: Run = self
            .send(
                self.client
                    .post(runs_url)
                    .json(&json!({ "assistant_id": self.agent_id })),
            )
            .await?;
        let run = self.wait_for(conversation_id, run).await?;

        if run.status != "completed" {
            let detail = run
                .last_error
                .map(|error| format!("{}: {}", error.code, error.message))
                .unwrap_or_else(|| "no error reported".to_string());
            return Err(AgentError::RunFailed {
                status: run.status,
                detail,
            });
        }

        let reply = self.run_text(conversation_id, &run.id).await?;
        Ok(AgentReply {
            conversation_id: conversation_id.to_string(),
            activities: vec![Activity::message(reply).in_conversation(conversation_id)],
        })
    }

    fn name(&self) -> &str {
        &self.agent_id
    }
}
