use std::{fmt, str::FromStr, sync::Arc};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::HeaderMap, Client, Response};
use serde_json::json;

use crate::{
    agent::{Activity, ActivityStream, AgentError, AgentReply, ConversationalAgent},
    auth::TokenCredential,
    config::{environment_id_parts, ConfigError, ConnectionSettings},
};

const API_VERSION: &str = "2022-03-01-preview";
const CONVERSATION_ID_HEADER: &str = "x-ms-conversationid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerPlatformCloud {
    Prod,
    FirstRelease,
    Preprod,
    Test,
    Dev,
    Gov,
    High,
    DoD,
    Mooncake,
    Other,
}

impl PowerPlatformCloud {
    fn api_host(self) -> Option<&'static str> {
        match self {
            Self::Prod | Self::FirstRelease => Some("api.powerplatform.com"),
            Self::Preprod => Some("api.preprod.powerplatform.com"),
            Self::Test => Some("api.test.powerplatform.com"),
            Self::Dev => Some("api.dev.powerplatform.com"),
            Self::Gov => Some("api.gov.powerplatform.microsoft.us"),
            Self::High => Some("api.high.powerplatform.microsoft.us"),
            Self::DoD => Some("api.appsplatform.us"),
            Self::Mooncake => Some("api.powerplatform.partner.microsoftonline.cn"),
            Self::Other => None,
        }
    }

    pub(crate) fn id_suffix_len(self) -> usize {
        match self {
            Self::Prod | Self::FirstRelease => 2,
            _ => 1,
        }
    }
}

impl FromStr for PowerPlatformCloud {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "public" => Ok(Self::Prod),
            "firstrelease" => Ok(Self::FirstRelease),
            "preprod" => Ok(Self::Preprod),
            "test" => Ok(Self::Test),
            "dev" => Ok(Self::Dev),
            "gov" | "govfr" => Ok(Self::Gov),
            "high" => Ok(Self::High),
            "dod" => Ok(Self::DoD),
            "mooncake" => Ok(Self::Mooncake),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown Power Platform cloud '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentType {
    Published,
    Prebuilt,
}

impl AgentType {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Published => "dataverse-backed",
            Self::Prebuilt => "prebuilt",
        }
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "published" => Ok(Self::Published),
            "prebuilt" => Ok(Self::Prebuilt),
            other => Err(format!("unknown agent type '{other}'")),
        }
    }
}

fn environment_host(settings: &ConnectionSettings) -> Result<String, ConfigError> {
    let api_host = match settings.cloud.api_host() {
        Some(host) => host.to_string(),
        None => settings
            .custom_power_platform_cloud
            .clone()
            .ok_or(ConfigError::Missing("CUSTOM_POWER_PLATFORM_CLOUD (required when CLOUD=Other)"))?,
    };

    let environment_id = settings
        .environment_id
        .as_deref()
        .ok_or(ConfigError::Missing("ENVIRONMENT_ID (or DIRECT_CONNECT_URL)"))?;
    let (prefix, suffix) = environment_id_parts(environment_id, settings.cloud)?;

    Ok(format!("{prefix}.{suffix}.environment.{api_host}"))
}

/// Base URL for the agent's conversations collection, without query string.
pub fn conversations_base_url(settings: &ConnectionSettings) -> Result<String, ConfigError> {
    if let Some(direct) = &settings.direct_connect_url {
        let trimmed = direct.split('?').next().unwrap_or(direct).trim_end_matches('/');
        let base = trimmed.strip_suffix("/conversations").unwrap_or(trimmed);
        return Ok(format!("{base}/conversations"));
    }

    Ok(format!(
        "https://{}/copilotstudio/{}/authenticated/bots/{}/conversations",
        environment_host(settings)?,
        settings.agent_type.path_segment(),
        settings.agent_identifier
    ))
}

/// Default OAuth scope for the configured cloud.
pub fn token_scope(settings: &ConnectionSettings) -> String {
    let host = settings
        .cloud
        .api_host()
        .map(str::to_string)
        .or_else(|| settings.custom_power_platform_cloud.clone())
        .unwrap_or_else(|| "api.powerplatform.com".to_string());
    format!("https://{host}/.default")
}

pub struct CopilotStudioClient {
    client: Client,
    base_url: String,
    agent_identifier: String,
    credential: Arc<dyn TokenCredential>,
}

impl fmt::Debug for CopilotStudioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopilotStudioClient")
            .field("base_url", &self.base_url)
            .field("agent_identifier", &self.agent_identifier)
            .field("credential", &self.credential.kind())
            .finish()
    }
}

impl CopilotStudioClient {
    pub fn new(
        settings: &ConnectionSettings,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: conversations_base_url(settings)?,
            agent_identifier: settings.agent_identifier.clone(),
            credential,
        })
    }

    fn url(&self, conversation_id: Option<&str>) -> String {
        match conversation_id {
            Some(id) => format!("{}/{}?api-version={}", self.base_url, id, API_VERSION),
            None => format!("{}?api-version={}", self.base_url, API_VERSION),
        }
    }

    async fn post(&self, url: String, body: serde_json::Value) -> Result<Response, AgentError> {
        let token = self.credential.token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token.secret())
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// Streams the activities of a new conversation as they arrive.
    pub async fn start_stream(&self) -> Result<(Option<String>, ActivityStream), AgentError> {
        let response = self
            .post(self.url(None), json!({ "emitStartConversationEvent": true }))
            .await?;
        let conversation_id = conversation_id_header(response.headers());
        Ok((conversation_id, activity_stream(response)))
    }

    pub async fn ask_stream(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<ActivityStream, AgentError> {
        let activity = Activity::message(text).in_conversation(conversation_id);
        let response = self
            .post(self.url(Some(conversation_id)), json!({ "activity": activity }))
            .await?;
        Ok(activity_stream(response))
    }
}

#[async_trait]
impl ConversationalAgent for CopilotStudioClient {
    async fn connect(&self) -> Result<(), AgentError> {
        let token = self.credential.token().await?;
        tracing::debug!(
            credential = self.credential.kind(),
            expires_at = ?token.expires_at(),
            "credential ready"
        );
        Ok(())
    }

    async fn start_conversation(&self) -> Result<AgentReply, AgentError> {
        let (header_id, stream) = self.start_stream().await?;
        let activities = collect(stream).await?;

        let conversation_id = header_id
            .or_else(|| {
                activities
                    .iter()
                    .find_map(|a| a.conversation.as_ref().map(|c| c.id.clone()))
            })
            .ok_or(AgentError::MissingConversationId)?;

        tracing::debug!(%conversation_id, activities = activities.len(), "conversation started");
        Ok(AgentReply {
            conversation_id,
            activities,
        })
    }

    async fn ask(&self, conversation_id: &str, text: &str) -> Result<AgentReply, AgentError> {
        let stream = self.ask_stream(conversation_id, text).await?;
        let activities = collect(stream).await?;
        Ok(AgentReply {
            conversation_id: conversation_id.to_string(),
            activities,
        })
    }

    fn name(&self) -> &str {
        &self.agent_identifier
    }
}

async fn collect(mut stream: ActivityStream) -> Result<Vec<Activity>, AgentError> {
    let mut activities = Vec::new();
    while let Some(activity) = stream.next().await {
        activities.push(activity?);
    }
    Ok(activities)
}

fn conversation_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONVERSATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn activity_stream(response: Response) -> ActivityStream {
    let stream = try_stream! {
        let mut buffer = Vec::new();
        let mut body_stream = response.bytes_stream();

        'outer: while let Some(chunk) = body_stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);

            while let Some(event) = extract_sse_event(&mut buffer) {
                match parse_event(&event)? {
                    SseEvent::Activity(activity) => yield activity,
                    SseEvent::End => {
                        buffer.clear();
                        break 'outer;
                    }
                    SseEvent::Ignored => continue,
                }
            }
        }

        // A final event without a trailing blank line.
        if !buffer.is_empty() {
            if let SseEvent::Activity(activity) = parse_event(&buffer)? {
                yield activity;
            }
        }
    };

    Box::pin(stream)
}

#[derive(Debug)]
enum SseEvent {
    Activity(Activity),
    End,
    Ignored,
}

fn extract_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    if let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let event = buffer[..pos].to_vec();
        buffer.drain(..pos + 2);
        return Some(event);
    }

    if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
        let event = buffer[..pos].to_vec();
        buffer.drain(..pos + 4);
        return Some(event);
    }

    None
}

fn parse_event(event: &[u8]) -> Result<SseEvent, AgentError> {
    let text = std::str::from_utf8(event)
        .map_err(|_| AgentError::InvalidStream("event contained invalid utf-8".into()))?;

    let mut name = None;
    let mut payload = String::new();
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !payload.is_empty() {
                payload.push('\n');
            }
            payload.push_str(value.trim_start());
        }
    }

    match name.as_deref() {
        Some("end") => Ok(SseEvent::End),
        Some("activity") | None if !payload.trim().is_empty() => {
            Ok(SseEvent::Activity(serde_json::from_str(payload.trim())?))
        }
        _ => Ok(SseEvent::Ignored),
    }
}
