//! Test inputs: prompt/expectation pairs, recorded conversations and
//! agent-to-agent scenarios.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const INPUT_COLUMN: &str = "input_text";
pub const EXPECTED_COLUMN: &str = "expected_output";
pub const CONVERSATION_COLUMN: &str = "Conversation";

#[derive(Debug, Error)]
pub enum CaseError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CSV in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path} row {row}: '{column}' is empty")]
    EmptyField {
        path: PathBuf,
        row: usize,
        column: &'static str,
    },
    #[error("invalid document {path}: {message}")]
    Document { path: PathBuf, message: String },
    #[error("{path} contains no cases")]
    Empty { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input_text: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input_text: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// A conversation captured elsewhere, judged without talking to any agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedConversation {
    pub conversation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub initial_topic: String,
    #[serde(default)]
    pub expected_themes: Vec<String>,
    /// Let the partner model write the opening line instead of sending the
    /// topic verbatim.
    #[serde(default)]
    pub generate_opening: bool,
}

impl Scenario {
    pub fn industrial_safety() -> Self {
        Self {
            name: "Industrial Safety Equipment Inquiry".to_string(),
            initial_topic: "I need cut-resistant gloves for mining operations".to_string(),
            expected_themes: ["cut resistance", "mining", "gloves", "safety", "compliance"]
                .iter()
                .map(|theme| theme.to_string())
                .collect(),
            generate_opening: false,
        }
    }

    pub fn expected_summary(&self) -> String {
        format!(
            "A meaningful multi-turn conversation about {}",
            self.expected_themes.join(", ")
        )
    }
}

fn open_csv(path: &Path) -> Result<csv::Reader<fs::File>, CaseError> {
    let file = fs::File::open(path).map_err(|source| CaseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new().flexible(true).from_reader(file))
}

fn column_index(
    reader: &mut csv::Reader<fs::File>,
    path: &Path,
    column: &'static str,
) -> Result<usize, CaseError> {
    let headers = reader.headers().map_err(|source| CaseError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    headers
        .iter()
        .position(|header| header.trim().trim_start_matches('\u{feff}') == column)
        .ok_or(CaseError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })
}

fn field(
    record: &csv::StringRecord,
    index: usize,
    path: &Path,
    row: usize,
    column: &'static str,
) -> Result<String, CaseError> {
    match record.get(index) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(CaseError::EmptyField {
            path: path.to_path_buf(),
            row,
            column,
        }),
    }
}

/// Reads `input_text`/`expected_output` rows. Row numbers in errors count the
/// header as row 1.
pub fn load_test_cases(path: impl AsRef<Path>) -> Result<Vec<TestCase>, CaseError> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;
    let input_index = column_index(&mut reader, path, INPUT_COLUMN)?;
    let expected_index = column_index(&mut reader, path, EXPECTED_COLUMN)?;

    let mut cases = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let row = offset + 2;
        let record = record.map_err(|source| CaseError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        cases.push(TestCase {
            input_text: field(&record, input_index, path, row, INPUT_COLUMN)?,
            expected_output: field(&record, expected_index, path, row, EXPECTED_COLUMN)?,
        });
    }

    if cases.is_empty() {
        return Err(CaseError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(cases)
}

pub fn load_recorded_conversations(
    path: impl AsRef<Path>,
) -> Result<Vec<RecordedConversation>, CaseError> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;
    let index = column_index(&mut reader, path, CONVERSATION_COLUMN)?;

    let mut conversations = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let record = record.map_err(|source| CaseError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        conversations.push(RecordedConversation {
            conversation: field(&record, index, path, offset + 2, CONVERSATION_COLUMN)?,
        });
    }

    if conversations.is_empty() {
        return Err(CaseError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(conversations)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Parses a YAML or JSON document (chosen by extension, YAML otherwise).
pub fn load_document<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, CaseError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| CaseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let parsed = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_slice(&bytes).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| CaseError::Document {
        path: path.to_path_buf(),
        message,
    })
}

/// Accepts a single scenario or a list of them.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<Scenario>, CaseError> {
    let path = path.as_ref();
    let scenarios = match load_document::<OneOrMany<Scenario>>(path)? {
        OneOrMany::Many(scenarios) => scenarios,
        OneOrMany::One(scenario) => vec![scenario],
    };
    if scenarios.is_empty() {
        return Err(CaseError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(scenarios)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(contents.as_bytes()).expect("write");
        (dir, path)
    }

    #[test]
    fn loads_pairs_with_quoted_fields_and_extra_columns() {
        let (_dir, path) = write_temp(
            "cases.csv",
            "id,input_text,expected_output\n\
             1,What is the capital of France?,\"The capital of France is Paris, a city in Europe.\"\n\
             2,\"Symbol for water?\",H2O\n",
        );

        let cases = load_test_cases(&path).expect("cases");
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].input_text, "What is the capital of France?");
        assert_eq!(
            cases[0].expected_output,
            "The capital of France is Paris, a city in Europe."
        );
        assert_eq!(cases[1], TestCase::new("Symbol for water?", "H2O"));
    }

    #[test]
    fn reports_missing_column() {
        let (_dir, path) = write_temp("cases.csv", "input_text,answer\nq,a\n");
        let error = load_test_cases(&path).unwrap_err();
        assert!(matches!(error, CaseError::MissingColumn { column: EXPECTED_COLUMN, .. }));
    }

    #[test]
    fn reports_empty_field_with_row_number() {
        let (_dir, path) = write_temp("cases.csv", "input_text,expected_output\nq,a\n,b\n");
        let error = load_test_cases(&path).unwrap_err();
        match error {
            CaseError::EmptyField { row, column, .. } => {
                assert_eq!(row, 3);
                assert_eq!(column, INPUT_COLUMN);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_only_file_is_rejected() {
        let (_dir, path) = write_temp("cases.csv", "input_text,expected_output\n");
        assert!(matches!(load_test_cases(&path), Err(CaseError::Empty { .. })));
    }

    #[test]
    fn loads_recorded_conversations() {
        let (_dir, path) = write_temp(
            "recorded.csv",
            "Conversation\n\"user: hi\nbot: hello\"\n\"user: gloves?\nbot: ProSafe Cut D\"\n",
        );
        let recorded = load_recorded_conversations(&path).expect("recorded");
        assert_eq!(recorded.len(), 2);
        assert!(recorded[1].conversation.contains("ProSafe"));
    }

    #[test]
    fn loads_scenarios_from_yaml_list_or_single_json() {
        let (_dir, yaml) = write_temp(
            "scenarios.yaml",
            "- name: gloves\n  initial_topic: I need gloves\n  expected_themes: [gloves, safety]\n",
        );
        let scenarios = load_scenarios(&yaml).expect("yaml");
        assert_eq!(scenarios[0].expected_themes, vec!["gloves", "safety"]);
        assert!(!scenarios[0].generate_opening);

        let (_dir2, json) = write_temp(
            "scenario.json",
            r#"{"name":"boots","initial_topic":"steel caps","generate_opening":true}"#,
        );
        let scenarios = load_scenarios(&json).expect("json");
        assert_eq!(scenarios.len(), 1);
        assert!(scenarios[0].generate_opening);
        assert!(scenarios[0].expected_themes.is_empty());
    }

    #[test]
    fn default_scenario_summarises_themes() {
        let scenario = Scenario::industrial_safety();
        assert_eq!(
            scenario.expected_summary(),
            "A meaningful multi-turn conversation about cut resistance, mining, gloves, safety, compliance"
        );
    }
}
