use std::{path::PathBuf, process::ExitCode, sync::Arc};

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use convoeval::{
    agent::copilot_studio::token_scope,
    auth::{credential_from_settings, TokenCredential},
    cases::{load_recorded_conversations, load_scenarios, load_test_cases, Scenario},
    config::{
        load_dotenv, ConnectionSettings, FoundrySettings, IdentitySettings, JudgeSettings,
        PartnerSettings, RunSettings, TargetModelSettings, DEFAULT_FOUNDRY_SCOPE,
    },
    eval::{Evaluator, JudgeMetric, LexicalMetric, Metric, Rubric},
    providers::provider_for_endpoint,
    report::{default_report_path, write_report, EvalReport, ReportFormat},
    ConversationPartner, ConversationalAgent, CopilotStudioClient, EvalRunner, EvaluationResult,
    FoundryAgentClient, HarnessError, ProviderAgent, StaticTokenCredential,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "convoeval", version, about = "Evaluate conversational agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Report path (default: reports/report-<timestamp>.<ext>)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = Format::Html)]
    format: Format,

    #[arg(long, global = true, value_enum, default_value_t = MetricKind::Judge)]
    metric: MetricKind,

    /// Override the rubric's pass threshold (0.0 - 1.0)
    #[arg(long, global = true)]
    threshold: Option<f64>,

    #[arg(long, global = true)]
    title: Option<String>,

    /// Agent under test
    #[arg(long, global = true, value_enum, default_value_t = Target::Copilot)]
    target: Target,
}

#[derive(Subcommand)]
enum Command {
    /// One prompt per CSV row, scored against expected_output
    Cases {
        #[arg(long, short)]
        input: PathBuf,
        /// Built-in rubric name or path to a rubric file
        #[arg(long, default_value = "correctness")]
        rubric: String,
        /// Send every case into one conversation
        #[arg(long)]
        reuse_conversation: bool,
    },
    /// Agent-to-agent sessions driven by a simulated user
    Converse {
        /// YAML or JSON scenarios (default: built-in safety equipment scenario)
        #[arg(long)]
        scenarios: Option<PathBuf>,
        #[arg(long)]
        max_turns: Option<usize>,
        #[arg(long)]
        end_marker: Option<String>,
        #[arg(long, default_value = "conversation_quality")]
        rubric: String,
    },
    /// Score conversations recorded elsewhere (CSV column "Conversation")
    Recorded {
        #[arg(long, short)]
        input: PathBuf,
        #[arg(long, default_value = "recorded_relevancy")]
        rubric: String,
    },
    /// Check configuration by talking to the partner model
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Html,
    Json,
}

impl From<Format> for ReportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Html => ReportFormat::Html,
            Format::Json => ReportFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricKind {
    Judge,
    Lexical,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    /// Copilot Studio agent from ENVIRONMENT_ID / AGENT_IDENTIFIER
    Copilot,
    /// Azure AI Foundry agent from AZURE_AI_PROJECT_ENDPOINT / AZURE_AI_AGENT_ID
    Foundry,
    /// Chat model from TARGET_MODEL on the partner endpoint
    Model,
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = load_dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,convoeval=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match dotenv {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Ok(None) => {}
        Err(error) => tracing::warn!(%error, "could not read .env file"),
    }
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            tracing::error!(%error, "run aborted");
            eprintln!("error: {error}");
            if error.is_fatal_setup() {
                eprintln!("check the environment variables or .env file");
            }
            ExitCode::from(2)
        }
    }
}

/// Returns whether every result passed.
async fn run(cli: Cli) -> Result<bool, HarnessError> {
    let generated_at = Utc::now();
    let mut run_settings = RunSettings::from_env()?;

    let (title, results) = match &cli.command {
        Command::Check => return check().await,
        Command::Cases {
            input,
            rubric,
            reuse_conversation,
        } => {
            let cases = load_test_cases(input)?;
            let rubric = rubric_for(rubric, cli.threshold)?;
            let agent = target_agent(cli.target)?;
            let runner = EvalRunner::new(evaluator(cli.metric)?, run_settings);
            tracing::info!(cases = cases.len(), rubric = %rubric.name, "running cases");
            let results = runner
                .run_cases(agent.as_ref(), &cases, &rubric, *reuse_conversation)
                .await?;
            (format!("Test cases: {}", input.display()), results)
        }
        Command::Converse {
            scenarios,
            max_turns,
            end_marker,
            rubric,
        } => {
            if let Some(max_turns) = max_turns {
                run_settings = run_settings.with_max_turns(*max_turns)?;
            }
            if let Some(marker) = end_marker {
                run_settings.end_marker = marker.clone();
            }
            let scenarios = match scenarios {
                Some(path) => load_scenarios(path)?,
                None => vec![Scenario::industrial_safety()],
            };
            let rubric = rubric_for(rubric, cli.threshold)?;
            let agent = target_agent(cli.target)?;
            let mut partner = partner()?;
            let runner = EvalRunner::new(evaluator(cli.metric)?, run_settings);
            tracing::info!(
                scenarios = scenarios.len(),
                max_turns = runner.settings().max_turns,
                partner = partner.model(),
                "running agent-to-agent sessions"
            );
            let results = runner
                .run_scenarios(agent.as_ref(), &mut partner, &scenarios, &rubric)
                .await?;
            ("Agent-to-agent sessions".to_string(), results)
        }
        Command::Recorded { input, rubric } => {
            let conversations = load_recorded_conversations(input)?;
            let rubric = rubric_for(rubric, cli.threshold)?;
            let runner = EvalRunner::new(evaluator(cli.metric)?, run_settings);
            let results = runner.run_recorded(&conversations, &rubric).await;
            (format!("Recorded conversations: {}", input.display()), results)
        }
    };

    let format = ReportFormat::from(cli.format);
    let report = EvalReport::new(cli.title.unwrap_or(title), generated_at, results);
    let path = cli
        .out
        .unwrap_or_else(|| default_report_path(generated_at, format));
    write_report(&report, &path, format)?;
    print_summary(&report.results);
    println!("report: {}", path.display());

    Ok(report.all_passed())
}

fn rubric_for(name: &str, threshold: Option<f64>) -> Result<Rubric, HarnessError> {
    let rubric = Rubric::resolve(name)?;
    Ok(match threshold {
        Some(threshold) => rubric.with_threshold(threshold)?,
        None => rubric,
    })
}

fn evaluator(kind: MetricKind) -> Result<Evaluator, HarnessError> {
    let metric: Arc<dyn Metric> = match kind {
        MetricKind::Lexical => Arc::new(LexicalMetric),
        MetricKind::Judge => {
            let settings = JudgeSettings::from_env()?;
            let provider = provider_for_endpoint(
                &settings.endpoint,
                &settings.api_key,
                &settings.api_version,
                settings.request_timeout,
            )?;
            Arc::new(JudgeMetric::new(provider, settings.model))
        }
    };
    Ok(Evaluator::new(metric))
}

fn partner() -> Result<ConversationPartner, HarnessError> {
    let settings = PartnerSettings::from_env()?;
    let provider = provider_for_endpoint(
        &settings.endpoint,
        &settings.api_key,
        &settings.api_version,
        settings.request_timeout,
    )?;
    Ok(ConversationPartner::new(provider, settings.model, settings.system_prompt))
}

fn target_agent(target: Target) -> Result<Box<dyn ConversationalAgent>, HarnessError> {
    match target {
        Target::Copilot => {
            let connection = ConnectionSettings::from_env()?;
            let identity = IdentitySettings::from_env()?;
            let credential = credential_from_settings(&identity, &token_scope(&connection))?;
            tracing::info!(
                agent = %connection.agent_identifier,
                cloud = ?connection.cloud,
                credential = credential.kind(),
                "connecting to Copilot Studio agent"
            );
            Ok(Box::new(CopilotStudioClient::new(&connection, credential)?))
        }
        Target::Foundry => {
            let settings = FoundrySettings::from_env()?;
            let credential: Arc<dyn TokenCredential> = match &settings.access_token {
                Some(token) => Arc::new(StaticTokenCredential::new(token.clone())),
                None => {
                    let mut identity = IdentitySettings::from_env()?;
                    identity.access_token = None;
                    identity.scope = None;
                    credential_from_settings(&identity, DEFAULT_FOUNDRY_SCOPE)?
                }
            };
            tracing::info!(
                agent = %settings.agent_id,
                endpoint = %settings.project_endpoint,
                credential = credential.kind(),
                "connecting to Foundry agent"
            );
            Ok(Box::new(FoundryAgentClient::new(&settings, credential)?))
        }
        Target::Model => {
            let settings = PartnerSettings::from_env()?;
            let target = TargetModelSettings::from_env();
            let provider = provider_for_endpoint(
                &settings.endpoint,
                &settings.api_key,
                &settings.api_version,
                settings.request_timeout,
            )?;
            let model = target.model.unwrap_or(settings.model);
            let mut agent = ProviderAgent::new("model-target", provider, model);
            if let Some(instructions) = target.system_prompt {
                agent = agent.with_instructions(instructions);
            }
            Ok(Box::new(agent))
        }
    }
}

/// Partner start plus one continuation, the same calls a session makes.
async fn check() -> Result<bool, HarnessError> {
    let settings = PartnerSettings::from_env()?;
    println!("partner endpoint: {}", settings.endpoint);
    println!("partner model:    {}", settings.model);
    println!("api version:      {}", settings.api_version);

    let mut partner = partner()?;
    let opening = partner
        .start_conversation("cut-resistant gloves for mining operations")
        .await?;
    println!("opening:  {opening}");
    let follow_up = partner
        .continue_conversation(
            "We offer cut levels A through F. Which level does your site require?",
            2,
        )
        .await?;
    println!("follow-up: {follow_up}");

    let ok = !opening.is_empty() && !follow_up.is_empty();
    println!("{}", if ok { "configuration OK" } else { "partner returned empty text" });
    Ok(ok)
}

fn print_summary(results: &[EvaluationResult]) {
    for result in results {
        println!(
            "{:<8} {:<40} score {:.2} / {:.2}  {}",
            format!("{:?}", result.status).to_uppercase(),
            result.id,
            result.score,
            result.threshold,
            result.reason
        );
    }
}
