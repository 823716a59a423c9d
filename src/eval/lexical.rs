use async_trait::async_trait;

use crate::eval::{
    metric::{Metric, MetricInput, MetricScore},
    rubric::Rubric,
    EvalError,
};

/// Offline fallback: string similarity between actual and expected output,
/// scaled by how many of the expected output's key terms the answer repeats.
/// Key terms are words with digits and capitalized words inside a sentence.
/// Ignores the rubric's steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalMetric;

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn similarity(actual: &str, expected: &str) -> f64 {
    let actual = normalize(actual);
    let expected = normalize(expected);
    if actual.is_empty() || expected.is_empty() {
        return if actual == expected { 1.0 } else { 0.0 };
    }
    if actual == expected {
        return 1.0;
    }
    strsim::normalized_levenshtein(&actual, &expected).max(strsim::sorensen_dice(&actual, &expected))
}

fn words(text: &str) -> impl Iterator<Item = (&str, String)> {
    text.split_whitespace().map(|word| {
        let token: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        (word, token)
    })
}

pub fn key_terms(expected: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut sentence_start = true;
    for (word, token) in words(expected) {
        if !token.is_empty() {
            let has_digit = token.chars().any(|c| c.is_ascii_digit());
            let capitalized = token.chars().next().is_some_and(char::is_uppercase);
            let term = token.to_lowercase();
            if (has_digit || (capitalized && !sentence_start)) && !terms.contains(&term) {
                terms.push(term);
            }
        }
        sentence_start = word.ends_with(['.', '!', '?', ':']);
    }
    terms
}

/// Key terms of `expected` that do not occur as words in `actual`.
pub fn missing_key_terms(actual: &str, expected: &str) -> Vec<String> {
    let present: Vec<String> = words(actual).map(|(_, token)| token.to_lowercase()).collect();
    key_terms(expected)
        .into_iter()
        .filter(|term| !present.contains(term))
        .collect()
}

#[async_trait]
impl Metric for LexicalMetric {
    async fn measure(&self, _rubric: &Rubric, input: &MetricInput) -> Result<MetricScore, EvalError> {
        let expected = input.expected_output.as_deref().ok_or(EvalError::MissingParam {
            metric: "lexical",
            param: "expected_output",
        })?;
        let similarity = similarity(&input.actual_output, expected);
        let terms = key_terms(expected);
        let missing = missing_key_terms(&input.actual_output, expected);
        if missing.is_empty() {
            return Ok(MetricScore::new(
                similarity,
                format!("lexical similarity to the expected output is {similarity:.2}"),
            ));
        }

        let coverage = (terms.len() - missing.len()) as f64 / terms.len() as f64;
        Ok(MetricScore::new(
            similarity * coverage,
            format!(
                "lexical similarity is {similarity:.2} but the answer leaves out {}",
                missing.join(", ")
            ),
        ))
    }

    fn name(&self) -> &str {
        "lexical"
    }
}
