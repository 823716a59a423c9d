use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    agent::{Activity, AgentError, AgentReply, ConversationalAgent},
    types::{ChatMessage, CompletionRequest},
    LLMProvider,
};

/// Treats a chat-completion model as the agent under test. Each conversation
/// keeps its own message history.
pub struct ProviderAgent {
    name: String,
    provider: Arc<dyn LLMProvider>,
    model: String,
    instructions: Option<String>,
    greeting: Option<String>,
    conversations: Mutex<HashMap<String, Vec<ChatMessage>>>,
    next_id: AtomicUsize,
}

impl ProviderAgent {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            instructions: None,
            greeting: None,
            conversations: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, AgentError> {
        let guard = self
            .conversations
            .lock()
            .map_err(|_| AgentError::UnknownConversation(conversation_id.to_string()))?;
        guard
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownConversation(conversation_id.to_string()))
    }

    pub fn open_conversations(&self) -> usize {
        self.conversations.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    fn store(&self, conversation_id: &str, history: Vec<ChatMessage>) {
        if let Ok(mut guard) = self.conversations.lock() {
            guard.insert(conversation_id.to_string(), history);
        }
    }
}

#[async_trait]
impl ConversationalAgent for ProviderAgent {
    async fn start_conversation(&self) -> Result<AgentReply, AgentError> {
        let conversation_id = format!(
            "{}-{}",
            self.name,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );

        let mut history = Vec::new();
        if let Some(instructions) = &self.instructions {
            history.push(ChatMessage::system(instructions.clone()));
        }
        let mut activities = Vec::new();
        if let Some(greeting) = &self.greeting {
            history.push(ChatMessage::assistant(greeting.clone()));
            activities.push(Activity::message(greeting.clone()).in_conversation(&conversation_id));
        }
        self.store(&conversation_id, history);

        Ok(AgentReply {
            conversation_id,
            activities,
        })
    }

    async fn ask(&self, conversation_id: &str, text: &str) -> Result<AgentReply, AgentError> {
        let mut history = self.history(conversation_id)?;
        history.push(ChatMessage::user(text));

        let request = CompletionRequest::new(self.model.clone(), history.clone());
        let response = self.provider.complete(request).await?;
        let reply = response.text().to_string();

        history.push(ChatMessage::assistant(reply.clone()));
        self.store(conversation_id, history);

        Ok(AgentReply {
            conversation_id: conversation_id.to_string(),
            activities: vec![Activity::message(reply).in_conversation(conversation_id)],
        })
    }

    async fn end_conversation(&self, conversation_id: &str) {
        if let Ok(mut guard) = self.conversations.lock() {
            guard.remove(conversation_id);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
