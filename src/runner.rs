use tracing::{info, info_span, Instrument};

use crate::{
    agent::ConversationalAgent,
    cases::{RecordedConversation, Scenario, TestCase},
    config::RunSettings,
    conversation::{ConversationDriver, Opening},
    eval::{EvaluationResult, Evaluator, Rubric},
    error::HarnessError,
    partner::ConversationPartner,
};

/// Runs cases one after another and collects one result per case. A case
/// that fails never stops the run; an agent that rejects our credentials or
/// a shared conversation that cannot be opened does.
pub struct EvalRunner {
    evaluator: Evaluator,
    settings: RunSettings,
}

impl EvalRunner {
    pub fn new(evaluator: Evaluator, settings: RunSettings) -> Self {
        Self {
            evaluator,
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn driver<'a>(&self, agent: &'a dyn ConversationalAgent) -> ConversationDriver<'a> {
        ConversationDriver::new(agent, self.settings.max_turns)
            .with_end_marker(&self.settings.end_marker)
    }

    /// One prompt per case. With `reuse_conversation` every case is sent into
    /// a single conversation opened up front.
    pub async fn run_cases(
        &self,
        agent: &dyn ConversationalAgent,
        cases: &[TestCase],
        rubric: &Rubric,
        reuse_conversation: bool,
    ) -> Result<Vec<EvaluationResult>, HarnessError> {
        agent.connect().await?;
        let shared = if reuse_conversation {
            let opened = agent.start_conversation().await?;
            info!(conversation_id = %opened.conversation_id, "reusing one conversation for all cases");
            Some(opened.conversation_id)
        } else {
            None
        };

        let driver = self.driver(agent);
        let mut results = Vec::with_capacity(cases.len());
        for (index, case) in cases.iter().enumerate() {
            let id = format!("case-{}", index + 1);
            let span = info_span!("case", %id);
            let result = async {
                info!(input = %case.input_text, "sending case");
                let transcript = driver.run_single(shared.as_deref(), &case.input_text).await?;
                Ok::<_, HarnessError>(
                    self.evaluator.evaluate_case(id.as_str(), case, &transcript, rubric).await,
                )
            }
            .instrument(span)
            .await?;
            results.push(result);
        }
        Ok(results)
    }

    pub async fn run_scenarios(
        &self,
        agent: &dyn ConversationalAgent,
        partner: &mut ConversationPartner,
        scenarios: &[Scenario],
        rubric: &Rubric,
    ) -> Result<Vec<EvaluationResult>, HarnessError> {
        agent.connect().await?;
        let driver = self.driver(agent);
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let span = info_span!("scenario", name = %scenario.name);
            let result = async {
                let opening = if scenario.generate_opening {
                    Opening::Generated(scenario.initial_topic.clone())
                } else {
                    Opening::Verbatim(scenario.initial_topic.clone())
                };
                info!(topic = %scenario.initial_topic, "starting session");
                let transcript = driver.run_with_partner(partner, &opening, None).await?;
                info!(
                    turns = transcript.len(),
                    outcome = ?transcript.outcome(),
                    "session finished"
                );
                Ok::<_, HarnessError>(
                    self.evaluator
                        .evaluate_session(scenario.name.as_str(), scenario, &transcript, rubric)
                        .await,
                )
            }
            .instrument(span)
            .await?;
            results.push(result);
        }
        Ok(results)
    }

    pub async fn run_recorded(
        &self,
        conversations: &[RecordedConversation],
        rubric: &Rubric,
    ) -> Vec<EvaluationResult> {
        let mut results = Vec::with_capacity(conversations.len());
        for (index, recorded) in conversations.iter().enumerate() {
            let id = format!("recorded-{}", index + 1);
            let result = self
                .evaluator
                .evaluate_recorded(id.as_str(), recorded, rubric)
                .instrument(info_span!("recorded", %id))
                .await;
            results.push(result);
        }
        results
    }
}
