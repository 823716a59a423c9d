use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// A fixed prompt from a test case.
    Script,
    /// The simulated user in agent-to-agent sessions.
    Partner,
    /// The agent under test.
    Agent,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Self::Script => "User",
            Self::Partner => "Simulated User",
            Self::Agent => "Agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub number: usize,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// A single-prompt exchange got its reply.
    Completed,
    EndSignalled { by: Speaker },
    TurnLimit,
    Failed { error: String },
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::EndSignalled { by } => format!("ended by {}", by.label()),
            Self::TurnLimit => "turn limit reached".to_string(),
            Self::Failed { error } => format!("failed: {error}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TranscriptError {
    #[error("transcript already holds the maximum of {0} turns")]
    Full(usize),
    #[error("transcript is closed")]
    Closed,
}

/// Ordered record of one session. Turns can only be appended while the
/// transcript is open, and never beyond `max_turns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    conversation_id: Option<String>,
    max_turns: usize,
    turns: Vec<Turn>,
    outcome: Option<SessionOutcome>,
}

impl Transcript {
    pub fn new(max_turns: usize) -> Self {
        Self {
            conversation_id: None,
            max_turns,
            turns: Vec::new(),
            outcome: None,
        }
    }

    pub fn set_conversation_id(&mut self, id: impl Into<String>) {
        self.conversation_id = Some(id.into());
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.turns.len() >= self.max_turns
    }

    pub fn push(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
    ) -> Result<&Turn, TranscriptError> {
        if self.outcome.is_some() {
            return Err(TranscriptError::Closed);
        }
        if self.is_full() {
            return Err(TranscriptError::Full(self.max_turns));
        }

        self.turns.push(Turn {
            number: self.turns.len() + 1,
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        });
        Ok(&self.turns[self.turns.len() - 1])
    }

    /// Closes the transcript. The first outcome wins.
    pub fn close(&mut self, outcome: SessionOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn last_by(&self, speaker: Speaker) -> Option<&Turn> {
        self.turns.iter().rev().find(|turn| turn.speaker == speaker)
    }

    pub fn count_by(&self, speaker: Speaker) -> usize {
        self.turns.iter().filter(|turn| turn.speaker == speaker).count()
    }

    /// `Turn N - Label: text` blocks separated by blank lines.
    pub fn formatted(&self) -> String {
        let mut text = String::new();
        for turn in &self.turns {
            text.push_str(&format!(
                "Turn {} - {}: {}\n\n",
                turn.number,
                turn.speaker.label(),
                turn.text
            ));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_turns_from_one_and_caps_length() {
        let mut transcript = Transcript::new(2);
        assert_eq!(transcript.push(Speaker::Script, "hi").expect("first").number, 1);
        assert_eq!(transcript.push(Speaker::Agent, "hello").expect("second").number, 2);
        assert_eq!(
            transcript.push(Speaker::Script, "again").unwrap_err(),
            TranscriptError::Full(2)
        );
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn closed_transcript_rejects_turns_and_keeps_first_outcome() {
        let mut transcript = Transcript::new(5);
        transcript.close(SessionOutcome::TurnLimit);
        transcript.close(SessionOutcome::Completed);
        assert_eq!(transcript.outcome(), Some(&SessionOutcome::TurnLimit));
        assert_eq!(transcript.push(Speaker::Agent, "late").unwrap_err(), TranscriptError::Closed);
    }

    #[test]
    fn formats_and_counts_by_speaker() {
        let mut transcript = Transcript::new(5);
        transcript.push(Speaker::Partner, "Need gloves").expect("push");
        transcript.push(Speaker::Agent, "Which level?").expect("push");
        transcript.push(Speaker::Partner, "D").expect("push");

        assert_eq!(
            transcript.formatted(),
            "Turn 1 - Simulated User: Need gloves\n\nTurn 2 - Agent: Which level?\n\nTurn 3 - Simulated User: D\n\n"
        );
        assert_eq!(transcript.count_by(Speaker::Partner), 2);
        assert_eq!(transcript.last_by(Speaker::Agent).map(|t| t.text.as_str()), Some("Which level?"));
    }
}
