use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod azure_openai;
pub mod openai;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

/// Picks the client flavour from the endpoint: Azure hosts use deployment
/// URLs and the `api-key` header, everything else is treated as an
/// OpenAI-compatible `/v1` API (GitHub Models, local gateways).
pub fn provider_for_endpoint(
    endpoint: &str,
    api_key: &str,
    azure_api_version: &str,
    request_timeout: Duration,
) -> Result<Arc<dyn LLMProvider>, LLMError> {
    if is_azure_endpoint(endpoint) {
        let config = azure_openai::AzureOpenAIConfig::new(api_key, endpoint)
            .with_api_version(azure_api_version)
            .with_timeout(request_timeout);
        Ok(Arc::new(azure_openai::AzureOpenAI::from_config(config)?))
    } else {
        let config = openai::OpenAIConfig::new(api_key)
            .with_base_url(openai::versioned_base_url(endpoint))
            .with_timeout(request_timeout);
        Ok(Arc::new(openai::OpenAI::from_config(config)?))
    }
}

pub fn is_azure_endpoint(endpoint: &str) -> bool {
    endpoint.contains("azure.com")
}
