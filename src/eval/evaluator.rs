use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    cases::{RecordedConversation, Scenario, TestCase},
    conversation::{SessionOutcome, Speaker, Transcript, Turn},
    eval::{
        metric::{Metric, MetricInput},
        rubric::{ActualSelection, Rubric},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// One scripted prompt and its reply.
    Case,
    /// Agent-to-agent session.
    Session,
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Passed,
    Failed,
    /// The agent or the judge could not be reached; no score was produced.
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: String,
    pub kind: ResultKind,
    pub rubric: String,
    pub metric: String,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub status: ResultStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

/// Turns a finished case or session into one result.
pub struct Evaluator {
    metric: Arc<dyn Metric>,
}

struct Subject {
    id: String,
    kind: ResultKind,
    input: MetricInput,
    transcript: Option<Transcript>,
}

impl Evaluator {
    pub fn new(metric: Arc<dyn Metric>) -> Self {
        Self { metric }
    }

    pub fn metric_name(&self) -> &str {
        self.metric.name()
    }

    pub async fn evaluate_case(
        &self,
        id: impl Into<String>,
        case: &TestCase,
        transcript: &Transcript,
        rubric: &Rubric,
    ) -> EvaluationResult {
        let actual = transcript
            .last_by(Speaker::Agent)
            .map(|turn| turn.text.clone())
            .unwrap_or_default();
        let subject = Subject {
            id: id.into(),
            kind: ResultKind::Case,
            input: MetricInput::new(&case.input_text, actual).with_expected(&case.expected_output),
            transcript: Some(transcript.clone()),
        };
        self.score(subject, rubric, Vec::new()).await
    }

    pub async fn evaluate_session(
        &self,
        id: impl Into<String>,
        scenario: &Scenario,
        transcript: &Transcript,
        rubric: &Rubric,
    ) -> EvaluationResult {
        let actual = match rubric.actual {
            ActualSelection::FullTranscript => transcript.formatted(),
            ActualSelection::LastAgentTurn => transcript
                .last_by(Speaker::Agent)
                .map(|turn| turn.text.clone())
                .unwrap_or_default(),
        };
        let subject = Subject {
            id: id.into(),
            kind: ResultKind::Session,
            input: MetricInput::new(format!("Initial topic: {}", scenario.initial_topic), actual)
                .with_expected(scenario.expected_summary()),
            transcript: Some(transcript.clone()),
        };
        self.score(subject, rubric, structural_failures(transcript)).await
    }

    pub async fn evaluate_recorded(
        &self,
        id: impl Into<String>,
        recorded: &RecordedConversation,
        rubric: &Rubric,
    ) -> EvaluationResult {
        let subject = Subject {
            id: id.into(),
            kind: ResultKind::Recorded,
            input: MetricInput::new("", recorded.conversation.trim()),
            transcript: None,
        };
        self.score(subject, rubric, Vec::new()).await
    }

    async fn score(&self, subject: Subject, rubric: &Rubric, structural: Vec<String>) -> EvaluationResult {
        let Subject {
            id,
            kind,
            input,
            transcript,
        } = subject;

        let mut result = EvaluationResult {
            id,
            kind,
            rubric: rubric.name.clone(),
            metric: self.metric.name().to_string(),
            input: input.input.clone(),
            expected: input.expected_output.clone().unwrap_or_default(),
            actual: input.actual_output.clone(),
            score: 0.0,
            threshold: rubric.threshold,
            passed: false,
            status: ResultStatus::Failed,
            reason: String::new(),
            conversation_id: transcript
                .as_ref()
                .and_then(|t| t.conversation_id().map(str::to_string)),
            outcome: transcript.as_ref().and_then(|t| t.outcome().cloned()),
            turns: transcript.map(|t| t.turns().to_vec()).unwrap_or_default(),
        };

        if let Some(SessionOutcome::Failed { error }) = &result.outcome {
            warn!(id = %result.id, %error, "conversation failed, not scored");
            result.status = ResultStatus::Errored;
            result.reason = format!("conversation failed: {error}");
            return result;
        }

        if !structural.is_empty() {
            warn!(id = %result.id, checks = ?structural, "structural checks failed");
            result.reason = structural.join("; ");
            return result;
        }

        match self.metric.measure(rubric, &input).await {
            Ok(score) => {
                result.score = score.score;
                result.passed = rubric.passes(score.score);
                result.status = if result.passed {
                    ResultStatus::Passed
                } else {
                    ResultStatus::Failed
                };
                result.reason = score.reason;
                info!(
                    id = %result.id,
                    score = result.score,
                    threshold = result.threshold,
                    passed = result.passed,
                    "evaluated"
                );
            }
            Err(error) => {
                warn!(id = %result.id, %error, "metric failed");
                result.status = ResultStatus::Errored;
                result.reason = error.to_string();
            }
        }
        result
    }
}

/// Shape checks for agent-to-agent sessions, run before any scoring.
pub fn structural_failures(transcript: &Transcript) -> Vec<String> {
    let mut failures = Vec::new();
    if transcript.len() > transcript.max_turns() {
        failures.push(format!(
            "conversation has {} turns, above the limit of {}",
            transcript.len(),
            transcript.max_turns()
        ));
    }
    if transcript.len() < 2 {
        failures.push(format!(
            "conversation has {} turn(s), expected at least 2",
            transcript.len()
        ));
    }
    if transcript.count_by(Speaker::Partner) == 0 {
        failures.push("simulated user never spoke".to_string());
    }
    if transcript.count_by(Speaker::Agent) == 0 {
        failures.push("agent never replied".to_string());
    }
    failures
}
