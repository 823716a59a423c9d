use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::{
    agent::{AgentError, AgentReply, ConversationalAgent},
    conversation::transcript::{SessionOutcome, Speaker, Transcript},
    partner::ConversationPartner,
};

/// Limits that decide when a session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationPolicy {
    max_turns: usize,
    has_partner: bool,
}

impl ConversationPolicy {
    /// A prompt and its reply are the shortest possible exchange, so the
    /// limit is never below two turns.
    pub fn new(max_turns: usize, has_partner: bool) -> Self {
        Self {
            max_turns: max_turns.max(2),
            has_partner,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A turn was appended; `turns` is the transcript length afterwards.
    Appended { speaker: Speaker, turns: usize },
    EndSignalled { by: Speaker },
    TransportFailed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationState {
    Open,
    Exchanging,
    Closed(SessionOutcome),
}

impl ConversationState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn advance(self, policy: &ConversationPolicy, event: DriverEvent) -> Self {
        if self.is_closed() {
            return self;
        }

        match event {
            DriverEvent::TransportFailed { error } => Self::Closed(SessionOutcome::Failed { error }),
            DriverEvent::EndSignalled { by } => Self::Closed(SessionOutcome::EndSignalled { by }),
            DriverEvent::Appended { speaker, turns } => {
                if self == Self::Exchanging && speaker == Speaker::Agent && !policy.has_partner {
                    Self::Closed(SessionOutcome::Completed)
                } else if turns >= policy.max_turns {
                    Self::Closed(SessionOutcome::TurnLimit)
                } else {
                    Self::Exchanging
                }
            }
        }
    }
}

/// How an agent-to-agent session opens.
#[derive(Debug, Clone, PartialEq)]
pub enum Opening {
    /// Send this text as the partner's first message.
    Verbatim(String),
    /// Ask the partner model to open a conversation about this topic.
    Generated(String),
}

pub struct ConversationDriver<'a> {
    agent: &'a dyn ConversationalAgent,
    max_turns: usize,
    end_pattern: Option<Regex>,
}

fn end_marker_pattern(marker: &str) -> Option<Regex> {
    let marker = marker.trim();
    if marker.is_empty() {
        return None;
    }
    match RegexBuilder::new(&regex::escape(marker))
        .case_insensitive(true)
        .build()
    {
        Ok(pattern) => Some(pattern),
        Err(error) => {
            warn!(%error, marker, "end marker disabled");
            None
        }
    }
}

struct Session {
    transcript: Transcript,
    state: ConversationState,
    policy: ConversationPolicy,
}

impl Session {
    fn new(policy: ConversationPolicy) -> Self {
        Self {
            transcript: Transcript::new(policy.max_turns()),
            state: ConversationState::Open,
            policy,
        }
    }

    fn apply(&mut self, event: DriverEvent) {
        let state = std::mem::replace(&mut self.state, ConversationState::Open);
        self.state = state.advance(&self.policy, event);
        if let ConversationState::Closed(outcome) = &self.state {
            self.transcript.close(outcome.clone());
        }
    }

    fn append(&mut self, speaker: Speaker, text: &str) {
        match self.transcript.push(speaker, text) {
            Ok(turn) => {
                debug!(turn = turn.number, speaker = speaker.label(), chars = text.len(), "turn recorded");
                let turns = self.transcript.len();
                self.apply(DriverEvent::Appended { speaker, turns });
            }
            // The state machine closes at the limit, so this only guards the invariant.
            Err(error) => {
                warn!(%error, "turn dropped");
                self.apply(DriverEvent::EndSignalled { by: speaker });
            }
        }
    }

    fn fail(&mut self, error: impl ToString) {
        let error = error.to_string();
        warn!(%error, turns = self.transcript.len(), "conversation failed");
        self.apply(DriverEvent::TransportFailed { error });
    }

    /// Records a failed agent call. Authentication failures are handed back
    /// instead, since every later call would fail the same way.
    fn fail_agent(&mut self, error: AgentError) -> Result<(), AgentError> {
        if error.is_auth() {
            warn!(%error, "agent rejected our credentials");
            return Err(error);
        }
        self.fail(error);
        Ok(())
    }

    fn finish(mut self) -> Transcript {
        if !self.transcript.is_closed() {
            self.transcript.close(SessionOutcome::Completed);
        }
        self.transcript
    }
}

impl<'a> ConversationDriver<'a> {
    pub fn new(agent: &'a dyn ConversationalAgent, max_turns: usize) -> Self {
        Self {
            agent,
            max_turns,
            end_pattern: end_marker_pattern(crate::config::DEFAULT_END_MARKER),
        }
    }

    pub fn with_end_marker(mut self, marker: impl AsRef<str>) -> Self {
        self.end_pattern = end_marker_pattern(marker.as_ref());
        self
    }

    /// Removes the end marker (case-insensitive) and reports whether it was
    /// present.
    pub fn strip_end_marker(&self, text: &str) -> (String, bool) {
        let Some(pattern) = &self.end_pattern else {
            return (text.trim().to_string(), false);
        };
        if !pattern.is_match(text) {
            return (text.trim().to_string(), false);
        }
        (pattern.replace_all(text, "").trim().to_string(), true)
    }

    async fn open(
        &self,
        session: &mut Session,
        conversation_id: Option<&str>,
    ) -> Result<Option<String>, AgentError> {
        if let Some(id) = conversation_id {
            session.transcript.set_conversation_id(id);
            return Ok(Some(id.to_string()));
        }

        match self.agent.start_conversation().await {
            Ok(reply) => {
                debug!(
                    conversation_id = %reply.conversation_id,
                    greeting = %reply.text(),
                    "conversation opened"
                );
                session.transcript.set_conversation_id(reply.conversation_id.clone());
                Ok(Some(reply.conversation_id))
            }
            Err(error) => {
                session.fail_agent(error)?;
                Ok(None)
            }
        }
    }

    fn record_reply(&self, session: &mut Session, reply: &AgentReply) -> String {
        let (text, marker) = self.strip_end_marker(&reply.text());
        if !text.is_empty() {
            session.append(Speaker::Agent, &text);
        }
        if text.is_empty() || marker || reply.ends_conversation() {
            session.apply(DriverEvent::EndSignalled { by: Speaker::Agent });
        }
        text
    }

    /// Sends one prompt and records the reply. Transport failures close the
    /// transcript; only authentication failures are returned as errors.
    #[tracing::instrument(skip_all, fields(agent = self.agent.name()))]
    pub async fn run_single(
        &self,
        conversation_id: Option<&str>,
        prompt: &str,
    ) -> Result<Transcript, AgentError> {
        let owned = conversation_id.is_none();
        let mut session = Session::new(ConversationPolicy::new(self.max_turns, false));
        let Some(conversation_id) = self.open(&mut session, conversation_id).await? else {
            return Ok(session.finish());
        };

        session.append(Speaker::Script, prompt);
        let asked = self.agent.ask(&conversation_id, prompt).await;
        if owned {
            self.agent.end_conversation(&conversation_id).await;
        }
        match asked {
            Ok(reply) => {
                self.record_reply(&mut session, &reply);
            }
            Err(error) => session.fail_agent(error)?,
        }

        Ok(session.finish())
    }

    /// Alternates between the partner and the agent until either side ends
    /// the conversation, a transport call fails, or the turn limit is hit.
    #[tracing::instrument(skip_all, fields(agent = self.agent.name(), max_turns = self.max_turns))]
    pub async fn run_with_partner(
        &self,
        partner: &mut ConversationPartner,
        opening: &Opening,
        conversation_id: Option<&str>,
    ) -> Result<Transcript, AgentError> {
        let owned = conversation_id.is_none();
        let mut session = Session::new(ConversationPolicy::new(self.max_turns, true));
        let Some(conversation_id) = self.open(&mut session, conversation_id).await? else {
            return Ok(session.finish());
        };

        let exchanged = self
            .exchange(&mut session, partner, opening, &conversation_id)
            .await;
        if owned {
            self.agent.end_conversation(&conversation_id).await;
        }
        exchanged?;
        Ok(session.finish())
    }

    async fn exchange(
        &self,
        session: &mut Session,
        partner: &mut ConversationPartner,
        opening: &Opening,
        conversation_id: &str,
    ) -> Result<(), AgentError> {
        let first = match opening {
            Opening::Verbatim(text) => {
                partner.reset();
                partner.record_own_message(text, 1);
                text.clone()
            }
            Opening::Generated(topic) => match partner.start_conversation(topic).await {
                Ok(text) => text,
                Err(error) => {
                    session.fail(error);
                    return Ok(());
                }
            },
        };
        let (first, _) = self.strip_end_marker(&first);
        if first.is_empty() {
            session.apply(DriverEvent::EndSignalled { by: Speaker::Partner });
            return Ok(());
        }
        session.append(Speaker::Partner, &first);
        let mut message = first;

        while !session.state.is_closed() {
            let reply = match self.agent.ask(conversation_id, &message).await {
                Ok(reply) => reply,
                Err(error) => {
                    session.fail_agent(error)?;
                    break;
                }
            };
            let agent_text = self.record_reply(session, &reply);
            if session.state.is_closed() {
                break;
            }

            let agent_turn = session.transcript.len();
            let next = match partner.continue_conversation(&agent_text, agent_turn).await {
                Ok(next) => next,
                Err(error) => {
                    session.fail(error);
                    break;
                }
            };

            let (next, marker) = self.strip_end_marker(&next);
            if !next.is_empty() {
                session.append(Speaker::Partner, &next);
            }
            if next.is_empty() || marker {
                session.apply(DriverEvent::EndSignalled { by: Speaker::Partner });
            }
            message = next;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        agent::{Activity, ProviderAgent},
        auth::AuthError,
        providers::scripted::ScriptedProvider,
    };

    fn agent(replies: &[&str]) -> ProviderAgent {
        let provider = Arc::new(ScriptedProvider::new(replies.iter().copied()));
        ProviderAgent::new("advisor", provider, "model")
    }

    fn partner(replies: &[&str]) -> ConversationPartner {
        let provider = Arc::new(ScriptedProvider::new(replies.iter().copied()));
        ConversationPartner::new(provider, "sim", "You are a buyer.")
    }

    #[test]
    fn policy_never_drops_below_two_turns() {
        assert_eq!(ConversationPolicy::new(0, false).max_turns(), 2);
        assert_eq!(ConversationPolicy::new(7, true).max_turns(), 7);
    }

    #[test]
    fn single_prompt_completes_after_agent_reply() {
        let policy = ConversationPolicy::new(5, false);
        let state = ConversationState::Open
            .advance(&policy, DriverEvent::Appended { speaker: Speaker::Script, turns: 1 });
        assert_eq!(state, ConversationState::Exchanging);
        let state =
            state.advance(&policy, DriverEvent::Appended { speaker: Speaker::Agent, turns: 2 });
        assert_eq!(state, ConversationState::Closed(SessionOutcome::Completed));
    }

    #[test]
    fn partner_session_closes_at_turn_limit() {
        let policy = ConversationPolicy::new(3, true);
        let mut state = ConversationState::Open;
        for (turns, speaker) in [(1, Speaker::Partner), (2, Speaker::Agent)] {
            state = state.advance(&policy, DriverEvent::Appended { speaker, turns });
            assert_eq!(state, ConversationState::Exchanging);
        }
        let state =
            state.advance(&policy, DriverEvent::Appended { speaker: Speaker::Partner, turns: 3 });
        assert_eq!(state, ConversationState::Closed(SessionOutcome::TurnLimit));
    }

    #[test]
    fn closed_state_absorbs_further_events() {
        let policy = ConversationPolicy::new(3, true);
        let closed = ConversationState::Closed(SessionOutcome::TurnLimit);
        let after = closed.advance(&policy, DriverEvent::TransportFailed { error: "x".into() });
        assert_eq!(after, ConversationState::Closed(SessionOutcome::TurnLimit));
    }

    #[test]
    fn end_signal_and_failure_close_from_any_open_state() {
        let policy = ConversationPolicy::new(3, true);
        assert_eq!(
            ConversationState::Exchanging
                .advance(&policy, DriverEvent::EndSignalled { by: Speaker::Partner }),
            ConversationState::Closed(SessionOutcome::EndSignalled { by: Speaker::Partner })
        );
        assert!(matches!(
            ConversationState::Open.advance(&policy, DriverEvent::TransportFailed { error: "down".into() }),
            ConversationState::Closed(SessionOutcome::Failed { ref error }) if error == "down"
        ));
    }

    #[test]
    fn strips_end_marker_case_insensitively() {
        let target = agent(&[]);
        let driver = ConversationDriver::new(&target, 5);
        assert_eq!(driver.strip_end_marker("Thanks! [end]"), ("Thanks!".to_string(), true));
        assert_eq!(driver.strip_end_marker("[END]"), (String::new(), true));
        assert_eq!(driver.strip_end_marker(" Option 3 "), ("Option 3".to_string(), false));
    }

    #[test]
    fn strips_end_marker_next_to_non_ascii_text() {
        let target = agent(&[]);
        let driver = ConversationDriver::new(&target, 5);
        assert_eq!(
            driver.strip_end_marker("Danke, İstanbul ist gut [END]"),
            ("Danke, İstanbul ist gut".to_string(), true)
        );
        assert_eq!(
            driver.strip_end_marker("ÄÖÜ [End] straße"),
            ("ÄÖÜ  straße".to_string(), true)
        );
    }

    #[test]
    fn custom_marker_is_matched_literally() {
        let target = agent(&[]);
        let driver = ConversationDriver::new(&target, 5).with_end_marker("<done?>");
        assert_eq!(driver.strip_end_marker("bye <DONE?>"), ("bye".to_string(), true));
        assert_eq!(driver.strip_end_marker("bye <done>"), ("bye <done>".to_string(), false));

        let disabled = ConversationDriver::new(&target, 5).with_end_marker("  ");
        assert_eq!(disabled.strip_end_marker("[END]"), ("[END]".to_string(), false));
    }

    #[tokio::test]
    async fn single_prompt_records_prompt_and_reply() {
        let target = agent(&["Paris."]);
        let driver = ConversationDriver::new(&target, 5);
        let transcript = driver.run_single(None, "Capital of France?").await.expect("transcript");

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.outcome(), Some(&SessionOutcome::Completed));
        assert_eq!(transcript.conversation_id(), Some("advisor-1"));
        assert_eq!(transcript.last_by(Speaker::Agent).map(|t| t.text.as_str()), Some("Paris."));
    }

    #[tokio::test]
    async fn driver_releases_conversations_it_opened() {
        let target = agent(&["Paris.", "H2O.", "Which level?"]);
        let driver = ConversationDriver::new(&target, 3);

        driver.run_single(None, "Capital of France?").await.expect("first");
        driver.run_single(None, "Symbol for water?").await.expect("second");
        assert_eq!(target.open_conversations(), 0);

        let shared = target.start_conversation().await.expect("start").conversation_id;
        let mut sim = partner(&["Level D"]);
        driver
            .run_with_partner(&mut sim, &Opening::Verbatim("gloves".into()), Some(&shared))
            .await
            .expect("session");
        assert_eq!(target.open_conversations(), 1);
    }

    #[tokio::test]
    async fn partner_session_never_exceeds_max_turns() {
        let target = agent(&["Which level?", "Which size?", "Which colour?", "Here you go."]);
        let mut sim = partner(&["Level D", "Large", "Blue"]);
        let driver = ConversationDriver::new(&target, 5);

        let transcript = driver
            .run_with_partner(&mut sim, &Opening::Verbatim("I need gloves".into()), None)
            .await
            .expect("transcript");

        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript.outcome(), Some(&SessionOutcome::TurnLimit));
        assert_eq!(transcript.turns()[0].speaker, Speaker::Partner);
        assert_eq!(transcript.turns()[4].speaker, Speaker::Partner);
        assert_eq!(transcript.turns()[4].text, "Large");
    }

    #[tokio::test]
    async fn partner_end_marker_stops_early() {
        let target = agent(&["We recommend the ProSafe Cut D glove."]);
        let mut sim = partner(&["[END]"]);
        let driver = ConversationDriver::new(&target, 10);

        let transcript = driver
            .run_with_partner(&mut sim, &Opening::Verbatim("gloves please".into()), None)
            .await
            .expect("transcript");

        assert_eq!(transcript.len(), 2);
        assert_eq!(
            transcript.outcome(),
            Some(&SessionOutcome::EndSignalled { by: Speaker::Partner })
        );
    }

    #[tokio::test]
    async fn generated_opening_uses_partner_model() {
        let target = agent(&["Sure, what task?"]);
        let mut sim = partner(&["Hi, I need boots.", ""]);
        let driver = ConversationDriver::new(&target, 10);

        let transcript = driver
            .run_with_partner(&mut sim, &Opening::Generated("safety boots".into()), None)
            .await
            .expect("transcript");

        assert_eq!(transcript.turns()[0].text, "Hi, I need boots.");
        assert_eq!(
            transcript.outcome(),
            Some(&SessionOutcome::EndSignalled { by: Speaker::Partner })
        );
    }

    struct FlakyAgent;

    #[async_trait]
    impl ConversationalAgent for FlakyAgent {
        async fn start_conversation(&self) -> Result<AgentReply, AgentError> {
            Ok(AgentReply {
                conversation_id: "c-1".to_string(),
                activities: vec![Activity::message("Welcome")],
            })
        }

        async fn ask(&self, _conversation_id: &str, _text: &str) -> Result<AgentReply, AgentError> {
            Err(AgentError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn transport_failure_keeps_partial_transcript() {
        let target = FlakyAgent;
        let mut sim = partner(&[]);
        let driver = ConversationDriver::new(&target, 5);

        let transcript = driver
            .run_with_partner(&mut sim, &Opening::Verbatim("hello".into()), None)
            .await
            .expect("transcript");

        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.conversation_id(), Some("c-1"));
        match transcript.outcome() {
            Some(SessionOutcome::Failed { error }) => assert!(error.contains("502")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    struct LockedOutAgent;

    #[async_trait]
    impl ConversationalAgent for LockedOutAgent {
        async fn start_conversation(&self) -> Result<AgentReply, AgentError> {
            Ok(AgentReply {
                conversation_id: "c-1".to_string(),
                activities: Vec::new(),
            })
        }

        async fn ask(&self, _conversation_id: &str, _text: &str) -> Result<AgentReply, AgentError> {
            Err(AgentError::Auth(AuthError::Rejected {
                error: "invalid_client".to_string(),
                description: "bad secret".to_string(),
            }))
        }

        fn name(&self) -> &str {
            "locked-out"
        }
    }

    #[tokio::test]
    async fn authentication_failure_is_returned_not_recorded() {
        let target = LockedOutAgent;
        let driver = ConversationDriver::new(&target, 5);

        let error = driver.run_single(None, "hello").await.unwrap_err();
        assert!(error.is_auth());

        let mut sim = partner(&[]);
        let error = driver
            .run_with_partner(&mut sim, &Opening::Verbatim("hello".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Auth(AuthError::Rejected { .. })));
    }
}
