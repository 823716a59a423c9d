//! HTML and JSON reports over a finished run.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, SecondsFormat, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::eval::{EvaluationResult, ResultStatus};

const HTML_TEMPLATE: &str = include_str!("../templates/report.hbs");

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Html,
    Json,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Mean over scored results; errored results are left out.
    pub mean_score: f64,
}

impl ReportSummary {
    pub fn from_results(results: &[EvaluationResult]) -> Self {
        let count = |status: ResultStatus| results.iter().filter(|r| r.status == status).count();
        let scored: Vec<f64> = results
            .iter()
            .filter(|r| r.status != ResultStatus::Errored)
            .map(|r| r.score)
            .collect();
        let mean_score = if scored.is_empty() {
            0.0
        } else {
            scored.iter().sum::<f64>() / scored.len() as f64
        };

        Self {
            total: results.len(),
            passed: count(ResultStatus::Passed),
            failed: count(ResultStatus::Failed),
            errored: count(ResultStatus::Errored),
            mean_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub results: Vec<EvaluationResult>,
}

impl EvalReport {
    pub fn new(
        title: impl Into<String>,
        generated_at: DateTime<Utc>,
        results: Vec<EvaluationResult>,
    ) -> Self {
        Self {
            title: title.into(),
            generated_at,
            summary: ReportSummary::from_results(&results),
            results,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.total > 0 && self.summary.passed == self.summary.total
    }
}

#[derive(Serialize)]
struct TurnView<'a> {
    number: usize,
    speaker: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct ResultView<'a> {
    id: &'a str,
    status: &'static str,
    rubric: &'a str,
    metric: &'a str,
    input: &'a str,
    expected: &'a str,
    actual: &'a str,
    score: String,
    threshold: String,
    reason: &'a str,
    conversation_id: &'a str,
    outcome: Option<String>,
    turn_count: usize,
    turns: Vec<TurnView<'a>>,
}

#[derive(Serialize)]
struct ReportView<'a> {
    title: &'a str,
    generated_at: String,
    summary: SummaryView,
    results: Vec<ResultView<'a>>,
}

#[derive(Serialize)]
struct SummaryView {
    total: usize,
    passed: usize,
    failed: usize,
    errored: usize,
    mean_score: String,
}

fn status_label(status: ResultStatus) -> &'static str {
    match status {
        ResultStatus::Passed => "passed",
        ResultStatus::Failed => "failed",
        ResultStatus::Errored => "errored",
    }
}

impl<'a> ReportView<'a> {
    fn new(report: &'a EvalReport) -> Self {
        let results = report
            .results
            .iter()
            .map(|result| ResultView {
                id: &result.id,
                status: status_label(result.status),
                rubric: &result.rubric,
                metric: &result.metric,
                input: &result.input,
                expected: &result.expected,
                actual: &result.actual,
                score: format!("{:.2}", result.score),
                threshold: format!("{:.2}", result.threshold),
                reason: &result.reason,
                conversation_id: result.conversation_id.as_deref().unwrap_or(""),
                outcome: result.outcome.as_ref().map(|outcome| outcome.describe()),
                turn_count: result.turns.len(),
                turns: result
                    .turns
                    .iter()
                    .map(|turn| TurnView {
                        number: turn.number,
                        speaker: turn.speaker.label(),
                        text: &turn.text,
                    })
                    .collect(),
            })
            .collect();

        Self {
            title: &report.title,
            generated_at: report.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            summary: SummaryView {
                total: report.summary.total,
                passed: report.summary.passed,
                failed: report.summary.failed,
                errored: report.summary.errored,
                mean_score: format!("{:.2}", report.summary.mean_score),
            },
            results,
        }
    }
}

/// Self-contained HTML page. Every value is HTML-escaped.
pub fn render_html(report: &EvalReport) -> Result<String, ReportError> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    let rendered = hb.render_template(HTML_TEMPLATE, &ReportView::new(report))?;
    Ok(rendered)
}

pub fn render_json(report: &EvalReport) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn render(report: &EvalReport, format: ReportFormat) -> Result<String, ReportError> {
    match format {
        ReportFormat::Html => render_html(report),
        ReportFormat::Json => render_json(report),
    }
}

/// Renders and writes the report, creating parent directories.
pub fn write_report(
    report: &EvalReport,
    path: impl AsRef<Path>,
    format: ReportFormat,
) -> Result<(), ReportError> {
    let path = path.as_ref();
    let body = render(report, format)?;
    let io_error = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(path, body).map_err(io_error)?;
    info!(
        path = %path.display(),
        total = report.summary.total,
        passed = report.summary.passed,
        "report written"
    );
    Ok(())
}

/// `reports/report-<timestamp>.<ext>`
pub fn default_report_path(generated_at: DateTime<Utc>, format: ReportFormat) -> PathBuf {
    PathBuf::from("reports").join(format!(
        "report-{}.{}",
        generated_at.format("%Y%m%d-%H%M%S"),
        format.extension()
    ))
}
