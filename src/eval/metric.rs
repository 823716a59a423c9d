use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::eval::{rubric::Rubric, EvalError};

/// The values a rubric can look at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricInput {
    pub input: String,
    pub actual_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

impl MetricInput {
    pub fn new(input: impl Into<String>, actual_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            actual_output: actual_output.into(),
            expected_output: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    /// Normalized to `0.0..=1.0`.
    pub score: f64,
    pub reason: String,
}

impl MetricScore {
    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            score,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Metric: Send + Sync {
    async fn measure(&self, rubric: &Rubric, input: &MetricInput) -> Result<MetricScore, EvalError>;

    fn name(&self) -> &str;
}
