use std::{sync::Arc, time::Duration};

use convoeval::{
    config::FoundrySettings, AgentError, ConversationalAgent, FoundryAgentClient,
    StaticTokenCredential,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT: &str = "/api/projects/evals";

fn client(server: &MockServer) -> FoundryAgentClient {
    let settings = FoundrySettings {
        project_endpoint: format!("{}{PROJECT}", server.uri()),
        agent_id: "asst_cat".to_string(),
        api_version: "2025-05-01".to_string(),
        access_token: None,
        poll_interval: Duration::from_millis(10),
        run_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
    };
    FoundryAgentClient::new(&settings, Arc::new(StaticTokenCredential::new("foundry-token")))
        .expect("client")
}

async fn mount_thread(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT}/threads")))
        .and(query_param("api-version", "2025-05-01"))
        .and(header("authorization", "Bearer foundry-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "thread_1", "object": "thread"
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT}/threads/thread_1/messages")))
        .and(body_partial_json(json!({
            "role": "user",
            "content": "The dog chased the cat up the tree, who ran up the tree?"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_user", "role": "user"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn thread_run_is_polled_until_completed() {
    let server = MockServer::start().await;
    mount_thread(&server).await;

    Mock::given(method("POST"))
        .and(path(format!("{PROJECT}/threads/thread_1/runs")))
        .and(body_partial_json(json!({ "assistant_id": "asst_cat" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1", "status": "queued"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT}/threads/thread_1/runs/run_1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1", "status": "in_progress"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT}/threads/thread_1/runs/run_1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1", "status": "completed"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT}/threads/thread_1/messages")))
        .and(query_param("run_id", "run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                {
                    "id": "msg_user", "role": "user", "run_id": null,
                    "content": [{ "type": "text", "text": { "value": "The dog chased the cat up the tree, who ran up the tree?" } }]
                },
                {
                    "id": "msg_1", "role": "assistant", "run_id": "run_1",
                    "content": [{ "type": "text", "text": { "value": "The cat ran up the tree.", "annotations": [] } }]
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let agent = client(&server);
    let opened = agent.start_conversation().await.expect("thread");
    assert_eq!(opened.conversation_id, "thread_1");
    assert!(opened.activities.is_empty());

    let reply = agent
        .ask(&opened.conversation_id, "The dog chased the cat up the tree, who ran up the tree?")
        .await
        .expect("reply");
    assert_eq!(reply.text(), "The cat ran up the tree.");
    assert_eq!(agent.name(), "asst_cat");
}

#[tokio::test]
async fn failed_run_reports_last_error() {
    let server = MockServer::start().await;
    mount_thread(&server).await;

    Mock::given(method("POST"))
        .and(path(format!("{PROJECT}/threads/thread_1/runs")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_2",
            "status": "failed",
            "last_error": { "code": "rate_limit_exceeded", "message": "Try again later." }
        })))
        .mount(&server)
        .await;

    let agent = client(&server);
    let thread = agent.start_conversation().await.expect("thread").conversation_id;
    let error = agent
        .ask(&thread, "The dog chased the cat up the tree, who ran up the tree?")
        .await
        .unwrap_err();

    match error {
        AgentError::RunFailed { status, detail } => {
            assert_eq!(status, "failed");
            assert_eq!(detail, "rate_limit_exceeded: Try again later.");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rejected_thread_request_is_a_status_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{PROJECT}/threads")))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let error = client(&server).start_conversation().await.unwrap_err();
    assert!(matches!(error, AgentError::Status { status: 403, .. }));
}
