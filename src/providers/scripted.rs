use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse, ChatMessage},
    LLMError,
};

/// Replays canned completions in order. Used for dry runs and tests; also
/// records every request it received so callers can inspect prompts.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a provider failure after the already scripted responses.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut guard) = self.responses.lock() {
            guard.push_back(Err(message.into()));
        }
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request);
        }

        let next = self
            .responses
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider lock poisoned".to_string()))?
            .pop_front();

        match next {
            Some(Ok(response)) => Ok(CompletionResponse {
                message: ChatMessage::assistant(response),
                usage: None,
            }),
            Some(Err(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::ScriptExhausted),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_exhausts() {
        let provider = ScriptedProvider::new(["one", "two"]);
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);

        let first = provider.complete(request.clone()).await.expect("first");
        let second = provider.complete(request.clone()).await.expect("second");
        assert_eq!(first.text(), "one");
        assert_eq!(second.text(), "two");

        let error = provider.complete(request).await.unwrap_err();
        assert!(matches!(error, LLMError::ScriptExhausted));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_provider_error() {
        let provider = ScriptedProvider::new(["ok"]).then_fail("boom");
        let request = CompletionRequest::new("m", vec![]);

        provider.complete(request.clone()).await.expect("ok");
        let error = provider.complete(request).await.unwrap_err();
        assert!(matches!(error, LLMError::Provider(ref m) if m == "boom"));
        assert_eq!(provider.remaining(), 0);
    }
}
