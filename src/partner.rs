//! The automated conversation partner that plays the user in
//! agent-to-agent sessions.

use std::sync::Arc;

use crate::{
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

const PARTNER_TEMPERATURE: f32 = 0.7;
const PARTNER_MAX_TOKENS: u32 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct PartnerTurn {
    pub number: usize,
    pub message: ChatMessage,
}

pub struct ConversationPartner {
    provider: Arc<dyn LLMProvider>,
    model: String,
    system_prompt: String,
    history: Vec<PartnerTurn>,
}

impl ConversationPartner {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn history(&self) -> &[PartnerTurn] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Asks the partner for an opening message about `topic`. Clears any
    /// previous history.
    pub async fn start_conversation(&mut self, topic: &str) -> Result<String, LLMError> {
        self.reset();

        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(format!("Start a conversation about: {topic}")),
        ];
        let text = self.complete(messages).await?;

        self.history.push(PartnerTurn {
            number: 1,
            message: ChatMessage::assistant(text.clone()),
        });
        Ok(text)
    }

    /// Records the agent's `reply` (which was turn `turn_number`) and asks the
    /// partner for the next message.
    pub async fn continue_conversation(
        &mut self,
        reply: &str,
        turn_number: usize,
    ) -> Result<String, LLMError> {
        self.history.push(PartnerTurn {
            number: turn_number,
            message: ChatMessage::user(reply),
        });

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().map(|turn| turn.message.clone()));
        messages.push(ChatMessage::user(format!(
            "Continue the conversation based on the response above. This is turn {} of the conversation.",
            turn_number + 1
        )));

        let text = self.complete(messages).await?;
        self.history.push(PartnerTurn {
            number: turn_number + 1,
            message: ChatMessage::assistant(text.clone()),
        });
        Ok(text)
    }

    /// Notes a message the partner "said" without asking the model, e.g. a
    /// scenario's verbatim opening line.
    pub fn record_own_message(&mut self, text: &str, turn_number: usize) {
        self.history.push(PartnerTurn {
            number: turn_number,
            message: ChatMessage::assistant(text),
        });
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LLMError> {
        let request = CompletionRequest::new(self.model.clone(), messages)
            .with_temperature(PARTNER_TEMPERATURE)
            .with_max_tokens(PARTNER_MAX_TOKENS);
        let response = self.provider.complete(request).await?;
        Ok(response.text().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{providers::scripted::ScriptedProvider, types::MessageRole};

    #[tokio::test]
    async fn start_then_continue_builds_alternating_history() {
        let provider = Arc::new(ScriptedProvider::new(["I need gloves.", "Option 4"]));
        let mut partner = ConversationPartner::new(provider.clone(), "m", "You are a buyer.");

        let opening = partner.start_conversation("cut-resistant gloves").await.expect("open");
        assert_eq!(opening, "I need gloves.");

        let next = partner
            .continue_conversation("Which cut level? 1-5", 2)
            .await
            .expect("continue");
        assert_eq!(next, "Option 4");

        let numbers: Vec<usize> = partner.history().iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let requests = provider.requests();
        let second = &requests[1];
        assert_eq!(second.temperature, Some(0.7));
        assert_eq!(second.max_tokens, Some(500));
        assert_eq!(second.messages[0].role, MessageRole::System);
        assert_eq!(second.messages[1].role, MessageRole::Assistant);
        assert_eq!(second.messages[2].text(), Some("Which cut level? 1-5"));
        assert!(second.messages[3]
            .text()
            .unwrap_or_default()
            .contains("This is turn 3 of the conversation."));
    }

    #[tokio::test]
    async fn start_clears_previous_history() {
        let provider = Arc::new(ScriptedProvider::new(["a", "b"]));
        let mut partner = ConversationPartner::new(provider, "m", "sys");
        partner.start_conversation("x").await.expect("first");
        partner.start_conversation("y").await.expect("second");
        assert_eq!(partner.history().len(), 1);
    }
}
