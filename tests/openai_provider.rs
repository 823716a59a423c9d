use std::sync::Arc;

use convoeval::{
    providers::openai::{OpenAI, OpenAIConfig},
    ChatMessage, CompletionRequest, ConversationPartner, LLMError, LLMProvider,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> OpenAI {
    OpenAI::from_config(OpenAIConfig::new("test-key").with_base_url(server.uri())).expect("provider")
}

fn completion(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14 }
    })
}

#[tokio::test]
async fn completes_chat_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini", "temperature": 0.0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Paris.")))
        .expect(1)
        .mount(&server)
        .await;

    let request = CompletionRequest::new("gpt-4o-mini", vec![ChatMessage::user("Capital of France?")])
        .with_temperature(0.0);
    let response = provider(&server).complete(request).await.expect("completion");

    assert_eq!(response.text(), "Paris.");
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(14));
}

#[tokio::test]
async fn error_envelope_becomes_provider_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Bad credentials", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
    let error = provider(&server).complete(request).await.unwrap_err();
    assert!(matches!(error, LLMError::Provider(message) if message == "Bad credentials"));
}

#[tokio::test]
async fn partner_sends_topic_opening_with_sampling_settings() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "temperature": 0.7, "max_tokens": 500 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "Hi! I need cut-resistant gloves for a mining site.",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let mut partner = ConversationPartner::new(Arc::new(provider(&server)), "gpt-4o-mini", "You are a buyer.");
    let opening = partner
        .start_conversation("cut-resistant gloves")
        .await
        .expect("opening");

    assert!(opening.contains("cut-resistant gloves"));
    let received = server.received_requests().await.expect("recorded requests");
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).expect("json body");
    assert_eq!(
        body["messages"][1]["content"],
        "Start a conversation about: cut-resistant gloves"
    );
}
