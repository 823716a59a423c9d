//! Scoring of agent output against rubrics.

use thiserror::Error;

use crate::{cases::CaseError, LLMError};

pub mod evaluator;
pub mod judge;
pub mod lexical;
pub mod metric;
pub mod rubric;

pub use evaluator::{EvaluationResult, Evaluator, ResultKind, ResultStatus};
pub use judge::JudgeMetric;
pub use lexical::LexicalMetric;
pub use metric::{Metric, MetricInput, MetricScore};
pub use rubric::{ActualSelection, EvalParam, Rubric};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("judge request failed: {0}")]
    Provider(#[from] LLMError),
    #[error("judge reply has no usable score: {0}")]
    UnparseableVerdict(String),
    #[error("{metric} metric needs the {param} parameter")]
    MissingParam {
        metric: &'static str,
        param: &'static str,
    },
    #[error("unknown rubric '{0}' (built-in: correctness, pii_leakage, conversation_quality, recorded_relevancy)")]
    UnknownRubric(String),
    #[error("invalid rubric '{name}': {reason}")]
    InvalidRubric { name: String, reason: String },
    #[error(transparent)]
    Document(#[from] CaseError),
}
