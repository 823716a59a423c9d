use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::{
    eval::{
        metric::{Metric, MetricInput, MetricScore},
        rubric::{EvalParam, Rubric},
        EvalError,
    },
    types::{ChatMessage, CompletionRequest},
    LLMProvider,
};

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict evaluator of conversational AI output. \
Follow the evaluation steps exactly and answer with a single JSON object.";

const SCALE_MAX: f64 = 10.0;

static SCORE_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"?score"?\s*[:=]\s*"?(-?\d+(?:\.\d+)?)"#).unwrap());

/// Scores with a judge model prompted from the rubric's steps.
pub struct JudgeMetric {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl JudgeMetric {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn build_prompt(rubric: &Rubric, input: &MetricInput) -> Result<String, EvalError> {
        let mut prompt = format!("Metric: {}\n\n", rubric.name);
        if let Some(criteria) = &rubric.criteria {
            prompt.push_str(&format!("Criteria:\n{criteria}\n\n"));
        }
        if !rubric.evaluation_steps.is_empty() {
            prompt.push_str("Evaluation steps:\n");
            for (index, step) in rubric.evaluation_steps.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", index + 1, step));
            }
            prompt.push('\n');
        }

        for param in &rubric.params {
            let value = match param {
                EvalParam::Input => input.input.as_str(),
                EvalParam::ActualOutput => input.actual_output.as_str(),
                EvalParam::ExpectedOutput => {
                    input.expected_output.as_deref().ok_or(EvalError::MissingParam {
                        metric: "judge",
                        param: "expected_output",
                    })?
                }
            };
            prompt.push_str(&format!("{}:\n{}\n\n", param.label(), value));
        }

        let names: Vec<&str> = rubric.params.iter().map(|param| param.label()).collect();
        prompt.push_str(&format!(
            "Using only the evaluation steps and the {} above, return JSON of the form \
{{\"score\": <integer 0-10>, \"reason\": \"<one or two sentences>\"}}. \
10 means the steps are fully met, 0 means they are not met at all.",
            names.join(", ")
        ));
        Ok(prompt)
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Reads the first JSON object with a `score` field, falling back to a
/// `score: N` pattern for judges that ignore the JSON instruction.
pub fn parse_verdict(text: &str) -> Result<MetricScore, EvalError> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(object))) = stream.next() else {
            continue;
        };
        let Some(raw) = object.get("score").and_then(number) else {
            continue;
        };
        let reason = object
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        return Ok(MetricScore::new(raw / SCALE_MAX, reason));
    }

    if let Some(raw) = SCORE_FALLBACK
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(MetricScore::new(raw / SCALE_MAX, text.trim()));
    }

    Err(EvalError::UnparseableVerdict(text.chars().take(200).collect()))
}

#[async_trait]
impl Metric for JudgeMetric {
    async fn measure(&self, rubric: &Rubric, input: &MetricInput) -> Result<MetricScore, EvalError> {
        let prompt = Self::build_prompt(rubric, input)?;
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(JUDGE_SYSTEM_PROMPT), ChatMessage::user(prompt)],
        )
        .with_temperature(0.0)
        .with_json_output();

        let response = self.provider.complete(request).await?;
        let verdict = parse_verdict(response.text())?;
        debug!(rubric = %rubric.name, score = verdict.score, "judge verdict");
        Ok(verdict)
    }

    fn name(&self) -> &str {
        "judge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    #[test]
    fn parses_json_verdict_inside_prose() {
        let verdict =
            parse_verdict("Here you go:\n```json\n{\"score\": 8, \"reason\": \"Mostly right\"}\n```")
                .expect("verdict");
        assert!((verdict.score - 0.8).abs() < 1e-9);
        assert_eq!(verdict.reason, "Mostly right");
    }

    #[test]
    fn clamps_out_of_range_and_accepts_string_scores() {
        assert_eq!(parse_verdict(r#"{"score": 14}"#).expect("verdict").score, 1.0);
        assert!((parse_verdict(r#"{"score": "3"}"#).expect("verdict").score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_score_pattern() {
        let verdict = parse_verdict("Score: 6. The answer omits detail.").expect("verdict");
        assert!((verdict.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn rejects_reply_without_score() {
        assert!(matches!(
            parse_verdict("I cannot evaluate this."),
            Err(EvalError::UnparseableVerdict(_))
        ));
    }

    #[test]
    fn prompt_only_includes_selected_params() {
        let input = MetricInput::new("secret question", "the answer").with_expected("gold");
        let prompt = JudgeMetric::build_prompt(&Rubric::pii_leakage(), &input).expect("prompt");
        assert!(prompt.contains("Actual Output:\nthe answer"));
        assert!(!prompt.contains("secret question"));
        assert!(!prompt.contains("gold"));
        assert!(prompt.contains("1. Check whether the output includes"));
    }

    #[test]
    fn prompt_requires_expected_when_rubric_uses_it() {
        let input = MetricInput::new("q", "a");
        assert!(matches!(
            JudgeMetric::build_prompt(&Rubric::correctness(), &input),
            Err(EvalError::MissingParam { .. })
        ));
    }

    #[tokio::test]
    async fn measure_sends_json_request_at_zero_temperature() {
        let provider = Arc::new(ScriptedProvider::new([r#"{"score": 9, "reason": "Correct"}"#]));
        let metric = JudgeMetric::new(provider.clone(), "judge-model");
        let input = MetricInput::new("Capital of France?", "Paris.").with_expected("Paris");

        let score = metric.measure(&Rubric::correctness(), &input).await.expect("score");
        assert!((score.score - 0.9).abs() < 1e-9);

        let requests = provider.requests();
        assert_eq!(requests[0].model, "judge-model");
        assert_eq!(requests[0].temperature, Some(0.0));
        assert!(requests[0].response_format.is_some());
    }
}
