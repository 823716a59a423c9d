use std::{fs, sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use convoeval::{
    agent::copilot_studio::{AgentType, PowerPlatformCloud},
    cases::load_test_cases,
    config::{ConnectionSettings, RunSettings},
    providers::scripted::ScriptedProvider,
    report::{render_html, write_report},
    AgentError, ClientSecretCredential, CopilotStudioClient, EvalReport, EvalRunner, Evaluator,
    HarnessError, JudgeMetric, ReportFormat, ResultStatus, Rubric, StaticTokenCredential, TestCase,
};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn reply(text: &str) -> ResponseTemplate {
    let body = format!(
        "event: activity\ndata: {}\n\nevent: end\ndata: end\n\n",
        serde_json::json!({ "type": "message", "text": text })
    );
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn connection(server: &MockServer) -> ConnectionSettings {
    ConnectionSettings {
        environment_id: None,
        agent_identifier: "advisor".to_string(),
        cloud: PowerPlatformCloud::Prod,
        agent_type: AgentType::Published,
        custom_power_platform_cloud: None,
        direct_connect_url: Some(format!("{}/bots/advisor/conversations", server.uri())),
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn csv_cases_against_mock_agent_produce_one_row_each() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/bots/advisor/conversations"))
        .respond_with(reply("Hello!").insert_header("x-ms-conversationid", "conv-1"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bots/advisor/conversations/conv-1"))
        .and(body_string_contains("France"))
        .respond_with(reply("The capital of France is Paris."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bots/advisor/conversations/conv-1"))
        .and(body_string_contains("water"))
        .respond_with(reply("H3O is the correct chemical symbol for water"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bots/advisor/conversations/conv-1"))
        .and(body_string_contains("Mars"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let csv = dir.path().join("cases.csv");
    fs::write(
        &csv,
        "input_text,expected_output\n\
         What is the capital of France?,\"The capital of France is Paris, a city in Europe.\"\n\
         What is the chemical symbol for water?,H2O is the chemical formula for water.\n\
         Who lives on Mars?,Nobody.\n",
    )
    .expect("write csv");
    let cases = load_test_cases(&csv).expect("cases");

    let agent = CopilotStudioClient::new(
        &connection(&server),
        Arc::new(StaticTokenCredential::new("tok")),
    )
    .expect("client");

    let judge = Arc::new(ScriptedProvider::new([
        r#"{"score": 9, "reason": "Matches the expected answer."}"#,
        r#"{"score": 1, "reason": "H3O contradicts H2O."}"#,
    ]));
    let runner = EvalRunner::new(
        Evaluator::new(Arc::new(JudgeMetric::new(judge.clone(), "judge"))),
        RunSettings::default(),
    );

    let results = runner
        .run_cases(&agent, &cases, &Rubric::correctness(), false)
        .await
        .expect("run");

    assert_eq!(results.len(), cases.len());
    assert_eq!(results[0].status, ResultStatus::Passed);
    assert_eq!(results[1].status, ResultStatus::Failed);
    assert_eq!(results[2].status, ResultStatus::Errored);
    assert!(results[2].reason.contains("503"));
    assert_eq!(judge.requests().len(), 2);

    let report = EvalReport::new(
        "Smoke",
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        results,
    );
    assert!(!report.all_passed());
    assert_eq!(report.summary.passed, 1);

    let out = dir.path().join("reports/out.html");
    write_report(&report, &out, ReportFormat::Html).expect("write report");
    let html = fs::read_to_string(&out).expect("read report");
    assert_eq!(html, render_html(&report).expect("render"));
    assert!(html.contains("The capital of France is Paris."));
    assert!(html.contains("0.90 / 0.50"));
    assert_eq!(html.matches("<td class=\"errored\">errored</td>").count(), 1);
}

#[tokio::test]
async fn rejected_credentials_abort_the_run() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "invalid_client",
            "error_description": "bad secret"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bots/advisor/conversations"))
        .respond_with(reply("Hello!").insert_header("x-ms-conversationid", "conv-1"))
        .expect(0)
        .mount(&server)
        .await;

    let credential = ClientSecretCredential::new(
        &server.uri(),
        "tenant-1",
        "client-1",
        "wrong",
        "https://api.powerplatform.com/.default",
        Duration::from_secs(5),
    )
    .expect("credential");
    let agent = CopilotStudioClient::new(&connection(&server), Arc::new(credential)).expect("client");

    let judge = Arc::new(ScriptedProvider::default());
    let runner = EvalRunner::new(
        Evaluator::new(Arc::new(JudgeMetric::new(judge.clone(), "judge"))),
        RunSettings::default(),
    );
    let cases = vec![
        TestCase::new("What is the capital of France?", "Paris"),
        TestCase::new("What is the chemical symbol for water?", "H2O"),
    ];

    let error = runner
        .run_cases(&agent, &cases, &Rubric::correctness(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, HarnessError::Agent(AgentError::Auth(_))), "{error}");
    assert!(error.is_fatal_setup());
    assert!(judge.requests().is_empty());
}
