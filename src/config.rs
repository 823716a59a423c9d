//! Environment-driven configuration.
//!
//! Every section can be read from the process environment (after loading a
//! `.env` file, if one exists) or from an arbitrary lookup function, which is
//! what the tests use.

use std::{env, fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    agent::copilot_studio::{AgentType, PowerPlatformCloud},
    providers::azure_openai::DEFAULT_API_VERSION,
};

pub const DEFAULT_PARTNER_ENDPOINT: &str = "https://models.github.ai";
pub const DEFAULT_PARTNER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_MAX_TURNS: usize = 5;
/// A prompt and its reply.
pub const MIN_MAX_TURNS: usize = 2;
pub const DEFAULT_END_MARKER: &str = "[END]";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AGENTS_API_VERSION: &str = "2025-05-01";
pub const DEFAULT_FOUNDRY_SCOPE: &str = "https://ai.azure.com/.default";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_PARTNER_SYSTEM_PROMPT: &str = "You are a customer talking to a product advisor agent. \
Ask questions, pick from the options the advisor offers and follow up on its answers. \
Keep every message short and stay on the topic you were given. \
When the advisor has made a concrete product recommendation, reply with [END] and nothing else.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: set {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Loads `.env` from the working directory or its parents and returns its
/// path. A missing file is not an error.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(error) if error.not_found() => Ok(None),
        Err(error) => Err(error),
    }
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty<L>(lookup: &L, key: &str) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn parse_u64<L>(lookup: &L, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|error| ConfigError::Invalid {
                var,
                value,
                reason: error.to_string(),
            }),
    }
}

fn request_timeout<L>(lookup: &L) -> Result<Duration, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    Ok(parse_u64(lookup, "CONVOEVAL_REQUEST_TIMEOUT_MS")?
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT))
}

/// Splits a Power Platform environment id into the host prefix and the
/// cloud-specific suffix: dashes removed, lowercased, last one or two
/// characters split off.
pub fn environment_id_parts(
    environment_id: &str,
    cloud: PowerPlatformCloud,
) -> Result<(String, String), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var: "ENVIRONMENT_ID",
        value: environment_id.to_string(),
        reason: reason.to_string(),
    };

    let normalized: String = environment_id
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("only letters, digits and dashes are allowed"));
    }

    let suffix_len = cloud.id_suffix_len();
    if normalized.len() <= suffix_len {
        return Err(invalid("too short"));
    }
    let (prefix, suffix) = normalized.split_at(normalized.len() - suffix_len);
    Ok((prefix.to_string(), suffix.to_string()))
}

/// Where the agent under test lives.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub environment_id: Option<String>,
    pub agent_identifier: String,
    pub cloud: PowerPlatformCloud,
    pub agent_type: AgentType,
    pub custom_power_platform_cloud: Option<String>,
    pub direct_connect_url: Option<String>,
    pub request_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let direct_connect_url = non_empty(&lookup, "DIRECT_CONNECT_URL");
        let environment_id = non_empty(&lookup, "ENVIRONMENT_ID");
        if environment_id.is_none() && direct_connect_url.is_none() {
            return Err(ConfigError::Missing("ENVIRONMENT_ID (or DIRECT_CONNECT_URL)"));
        }

        let agent_identifier =
            non_empty(&lookup, "AGENT_IDENTIFIER").ok_or(ConfigError::Missing("AGENT_IDENTIFIER"))?;

        let cloud = match non_empty(&lookup, "CLOUD") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                var: "CLOUD",
                value,
                reason,
            })?,
            None => PowerPlatformCloud::Prod,
        };

        let agent_type = match non_empty(&lookup, "COPILOT_AGENT_TYPE") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                var: "COPILOT_AGENT_TYPE",
                value,
                reason,
            })?,
            None => AgentType::Published,
        };

        let custom_power_platform_cloud = non_empty(&lookup, "CUSTOM_POWER_PLATFORM_CLOUD");
        if direct_connect_url.is_none() {
            if cloud == PowerPlatformCloud::Other && custom_power_platform_cloud.is_none() {
                return Err(ConfigError::Missing(
                    "CUSTOM_POWER_PLATFORM_CLOUD (required when CLOUD=Other)",
                ));
            }
            if let Some(environment_id) = &environment_id {
                environment_id_parts(environment_id, cloud)?;
            }
        }

        Ok(Self {
            environment_id,
            agent_identifier,
            cloud,
            agent_type,
            custom_power_platform_cloud,
            direct_connect_url,
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

/// App registration used to obtain a token for the agent endpoint.
#[derive(Clone, PartialEq)]
pub struct IdentitySettings {
    pub authority_host: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub scope: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for IdentitySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySettings")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl IdentitySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let access_token = non_empty(&lookup, "COPILOT_ACCESS_TOKEN");
        let tenant_id = non_empty(&lookup, "TENANT_ID");
        let client_id = non_empty(&lookup, "APP_CLIENT_ID");
        let client_secret = non_empty(&lookup, "APP_CLIENT_SECRET");

        if access_token.is_none() {
            if client_id.is_none() {
                return Err(ConfigError::Missing("APP_CLIENT_ID"));
            }
            if tenant_id.is_none() {
                return Err(ConfigError::Missing("TENANT_ID"));
            }
            if client_secret.is_none() {
                return Err(ConfigError::Missing("APP_CLIENT_SECRET (or COPILOT_ACCESS_TOKEN)"));
            }
        }

        Ok(Self {
            authority_host: non_empty(&lookup, "AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
            tenant_id,
            client_id,
            client_secret,
            access_token,
            scope: non_empty(&lookup, "COPILOT_SCOPE"),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

/// Model that plays the user in agent-to-agent sessions.
#[derive(Clone, PartialEq)]
pub struct PartnerSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub system_prompt: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl fmt::Debug for PartnerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl PartnerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let api_key = non_empty(&lookup, "GITHUB_TOKEN")
            .or_else(|| non_empty(&lookup, "AZURE_API_KEY"))
            .ok_or(ConfigError::Missing("GITHUB_TOKEN or AZURE_API_KEY"))?;

        Ok(Self {
            endpoint: non_empty(&lookup, "AZURE_AI_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_PARTNER_ENDPOINT.to_string()),
            model: non_empty(&lookup, "AZURE_AI_MODEL")
                .unwrap_or_else(|| DEFAULT_PARTNER_MODEL.to_string()),
            api_key,
            system_prompt: non_empty(&lookup, "AZURE_AI_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_PARTNER_SYSTEM_PROMPT.to_string()),
            api_version: non_empty(&lookup, "AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

/// Model that scores results. Each value falls back to the partner's.
#[derive(Clone, PartialEq)]
pub struct JudgeSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl fmt::Debug for JudgeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgeSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl JudgeSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let api_key = non_empty(&lookup, "EVAL_API_KEY")
            .or_else(|| non_empty(&lookup, "GITHUB_TOKEN"))
            .or_else(|| non_empty(&lookup, "AZURE_API_KEY"))
            .ok_or(ConfigError::Missing("EVAL_API_KEY (or GITHUB_TOKEN / AZURE_API_KEY)"))?;

        Ok(Self {
            endpoint: non_empty(&lookup, "EVAL_ENDPOINT")
                .or_else(|| non_empty(&lookup, "AZURE_AI_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_PARTNER_ENDPOINT.to_string()),
            model: non_empty(&lookup, "EVAL_MODEL")
                .or_else(|| non_empty(&lookup, "AZURE_AI_MODEL"))
                .unwrap_or_else(|| DEFAULT_PARTNER_MODEL.to_string()),
            api_key,
            api_version: non_empty(&lookup, "AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_turns: usize,
    pub end_marker: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            end_marker: DEFAULT_END_MARKER.to_string(),
        }
    }
}

impl RunSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(max_turns) = parse_u64(&lookup, "CONVOEVAL_MAX_TURNS")? {
            settings = settings.with_max_turns(max_turns as usize)?;
        }
        if let Some(marker) = non_empty(&lookup, "CONVOEVAL_END_MARKER") {
            settings.end_marker = marker;
        }
        Ok(settings)
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Result<Self, ConfigError> {
        if max_turns < MIN_MAX_TURNS {
            return Err(ConfigError::Invalid {
                var: "CONVOEVAL_MAX_TURNS",
                value: max_turns.to_string(),
                reason: format!("must be at least {MIN_MAX_TURNS}"),
            });
        }
        self.max_turns = max_turns;
        Ok(self)
    }
}

/// Agent hosted in an Azure AI Foundry project (`--target foundry`).
#[derive(Clone, PartialEq)]
pub struct FoundrySettings {
    pub project_endpoint: String,
    pub agent_id: String,
    pub api_version: String,
    /// Used instead of the app registration when set.
    pub access_token: Option<String>,
    pub poll_interval: Duration,
    pub run_timeout: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for FoundrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoundrySettings")
            .field("project_endpoint", &self.project_endpoint)
            .field("agent_id", &self.agent_id)
            .field("api_version", &self.api_version)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("poll_interval", &self.poll_interval)
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

impl FoundrySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let project_endpoint = non_empty(&lookup, "AZURE_AI_PROJECT_ENDPOINT")
            .ok_or(ConfigError::Missing("AZURE_AI_PROJECT_ENDPOINT"))?;
        if !project_endpoint.starts_with("http://") && !project_endpoint.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "AZURE_AI_PROJECT_ENDPOINT",
                value: project_endpoint,
                reason: "expected an http(s) URL".to_string(),
            });
        }

        Ok(Self {
            project_endpoint,
            agent_id: non_empty(&lookup, "AZURE_AI_AGENT_ID")
                .ok_or(ConfigError::Missing("AZURE_AI_AGENT_ID"))?,
            api_version: non_empty(&lookup, "AZURE_AI_AGENTS_API_VERSION")
                .unwrap_or_else(|| DEFAULT_AGENTS_API_VERSION.to_string()),
            access_token: non_empty(&lookup, "AZURE_AI_ACCESS_TOKEN"),
            poll_interval: parse_u64(&lookup, "CONVOEVAL_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            run_timeout: parse_u64(&lookup, "CONVOEVAL_RUN_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RUN_TIMEOUT),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

/// Chat model used as the agent under test (`--target model`). Unset values
/// fall back to the partner's model and no system prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetModelSettings {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl TargetModelSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        Self {
            model: non_empty(&lookup, "TARGET_MODEL"),
            system_prompt: non_empty(&lookup, "TARGET_SYSTEM_PROMPT"),
        }
    }
}
