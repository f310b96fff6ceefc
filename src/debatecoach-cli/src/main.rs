//! DebateCoach CLI
//!
//! Drives realtime debate-practice sessions from the terminal: replays
//! captured realtime event logs through the session engine, analyzes
//! finished transcripts and mints realtime credentials.

use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use debatecoach_core::{
    analysis::{AnalysisRequest, Analyzer, DebateAnalysis},
    config::{default_config, Config},
    context::{DebateContext, Stance},
    conversation::{ConversationTurn, Role},
    loopback::Loopback,
    session::{SessionController, SessionPhase, SessionSnapshot},
    signaling::HttpCredentialIssuer,
    transport::CredentialIssuer,
};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "debatecoach",
    version,
    about = "Realtime AI debate practice",
    long_about = "Runs voice debate-practice sessions against a realtime model and analyzes the results."
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a session over the in-process transport, feeding it a captured event log
    Replay(ReplayArgs),
    /// Ask a model for coaching feedback on a saved transcript
    Analyze(AnalyzeArgs),
    /// Mint an ephemeral realtime credential
    Token(DebateArgs),
}

#[derive(Args)]
struct DebateArgs {
    /// Debate topic
    #[arg(short, long, default_value = "General Debate Topic")]
    topic: String,

    /// Your side: FOR or AGAINST
    #[arg(short, long, default_value = "FOR")]
    stance: String,

    /// Your name
    #[arg(short, long, default_value = "User")]
    name: String,
}

impl DebateArgs {
    fn context(&self) -> Result<DebateContext, Box<dyn std::error::Error>> {
        let stance: Stance = self.stance.parse()?;
        Ok(DebateContext::new(&self.name, &self.topic, stance))
    }
}

#[derive(Args)]
struct ReplayArgs {
    /// JSONL file of server events, one per line
    #[arg(value_name = "FILE")]
    events: PathBuf,

    #[command(flatten)]
    debate: DebateArgs,

    /// Delay between replayed events
    #[arg(long, default_value = "0", value_name = "MS")]
    pace_ms: u64,

    /// Typed message to send once connected (repeatable)
    #[arg(long, action = ArgAction::Append, value_name = "TEXT")]
    say: Vec<String>,

    /// Write the raw event log as JSONL
    #[arg(long, value_name = "FILE")]
    dump_events: Option<PathBuf>,

    /// Write the conversation as JSON, for `analyze`
    #[arg(long, value_name = "FILE")]
    save_transcript: Option<PathBuf>,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// JSON array of conversation turns
    #[arg(value_name = "TRANSCRIPT")]
    transcript: PathBuf,

    #[arg(short, long)]
    topic: String,

    #[arg(short, long, default_value = "FOR")]
    stance: String,

    /// Debate length in seconds
    #[arg(short, long, default_value = "300", value_name = "SECS")]
    duration: u64,

    /// Override the analysis model
    #[arg(short, long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debatecoach=info,debatecoach_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => default_config(),
    }
    .with_env_overrides();

    match cli.command {
        Command::Replay(args) => replay(config, args).await,
        Command::Analyze(args) => analyze(config, args).await,
        Command::Token(args) => token(config, args).await,
    }
}

fn api_key() -> String {
    env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
        String::new()
    })
}

fn header(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!("{}", format!("  {}", title).bright_blue().bold());
    println!("{}", "═".repeat(70).bright_blue());
    println!();
}

async fn replay(config: Config, args: ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context = args.debate.context()?;
    let content = std::fs::read_to_string(&args.events)?;

    header(&format!("{} - Replay", "DebateCoach".bold()));
    println!("{} {}", "Topic:".bold(), context.topic.bright_white());
    println!(
        "{} {} ({})",
        "Debater:".bold(),
        context.username.bright_cyan(),
        context.stance.display_name().yellow()
    );
    println!();

    let loopback = Loopback::new();
    let session = SessionController::new(config, loopback.deps());
    session.register_debate_tools().await;
    let mut phases = session.subscribe();
    let mut ready = session.ready();

    session.start(Some(context)).await;
    let snapshot = session.snapshot().await;
    if snapshot.phase != SessionPhase::Active {
        eprintln!("{} {}", "Error:".red().bold(), snapshot.status);
        std::process::exit(1);
    }
    println!("{} {}", "▶".bright_green(), snapshot.status.green());

    let remote = loopback
        .connector
        .remote()
        .ok_or("Loopback transport did not open a peer")?;

    tokio::time::timeout(Duration::from_secs(5), ready.wait_for(|r| *r)).await??;
    for text in &args.say {
        if let Err(e) = session.send_text(text).await {
            eprintln!("{} {}", "Warning:".yellow(), e);
        }
    }

    match remote
        .replay_lines(content.lines(), Duration::from_millis(args.pace_ms))
        .await
    {
        Ok(sent) => tracing::info!(sent, "Replayed events"),
        Err(e) => eprintln!("{} {}", "Warning:".yellow(), e),
    }

    // Queued behind the replayed events, so everything is handled first.
    if remote.disconnect().is_ok() {
        tokio::time::timeout(
            Duration::from_secs(10),
            phases.wait_for(|p| *p == SessionPhase::Inactive),
        )
        .await??;
    }

    let snapshot = session.snapshot().await;
    print_transcript(&snapshot.conversation);
    print_summary(&snapshot);

    if let Some(path) = &args.dump_events {
        let lines: Vec<&str> = snapshot.events.iter().map(|e| e.text.as_str()).collect();
        std::fs::write(path, lines.join("\n") + "\n")?;
        println!("{} {}", "Events written to".dimmed(), path.display());
    }
    if let Some(path) = &args.save_transcript {
        std::fs::write(path, serde_json::to_string_pretty(&snapshot.conversation)?)?;
        println!("{} {}", "Transcript written to".dimmed(), path.display());
    }

    Ok(())
}

fn print_transcript(turns: &[ConversationTurn]) {
    println!("{}", "─".repeat(70).dimmed());
    for turn in turns {
        let speaker = match turn.role {
            Role::User => "You".bright_cyan().bold(),
            Role::Assistant => "Coach".bright_magenta().bold(),
        };
        let marker = if turn.is_final { "" } else { " (partial)" };
        println!("{}{}", speaker, marker.dimmed());
        for line in textwrap(&turn.text, 66).lines() {
            println!("  {}", line);
        }
        println!();
    }
    println!("{}", "─".repeat(70).dimmed());
}

fn print_summary(snapshot: &SessionSnapshot) {
    println!("{} {}", "Status:".bold(), snapshot.status);
    println!("{} {}", "Duration:".bold(), snapshot.timer);
    println!("{} {}", "Turns:".bold(), snapshot.conversation.len());
    println!("{} {}", "Tool calls:".bold(), snapshot.tool_calls.len());
    println!(
        "{} {} total ({} in, {} out)",
        "Tokens:".bold(),
        snapshot.usage.total_tokens,
        snapshot.usage.input_tokens,
        snapshot.usage.output_tokens
    );
    if let Some(error) = &snapshot.last_error {
        println!("{} {}", "Last error:".red().bold(), error);
    }
}

async fn analyze(mut config: Config, args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(model) = args.model {
        config.analysis.model = model;
    }
    let stance: Stance = args.stance.parse()?;
    let turns: Vec<ConversationTurn> =
        serde_json::from_str(&std::fs::read_to_string(&args.transcript)?)?;

    let analyzer = Analyzer::new(config, &api_key())?;
    let request = AnalysisRequest {
        topic: &args.topic,
        stance,
        duration: Duration::from_secs(args.duration),
        turns: &turns,
    };

    header(&format!("{} - Analysis", "DebateCoach".bold()));
    let analysis = analyzer.analyze(&request).await?;
    print_analysis(&analysis);
    Ok(())
}

fn section(title: &str) {
    println!();
    println!("{}", title.bright_magenta().bold());
}

fn bullets(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("  {}", label.bold());
    for item in items {
        println!("    • {}", item);
    }
}

fn field(label: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    println!("  {} {}", format!("{}:", label).bold(), value);
}

fn print_analysis(analysis: &DebateAnalysis) {
    let arguments = &analysis.argument_analysis;
    section("Arguments");
    bullets("Main arguments", &arguments.main_arguments);
    field("Reasoning", &arguments.reasoning_quality);
    field("Evidence", &arguments.evidence_usage);
    bullets("Fallacies", &arguments.logical_fallacies);

    let rhetoric = &analysis.rhetorical_analysis;
    section("Rhetoric");
    println!(
        "  Persuasiveness {}/10, clarity {}/10",
        rhetoric.persuasiveness_score, rhetoric.clarity_score
    );
    field("Language", &rhetoric.language_effectiveness);
    bullets("Notable phrases", &rhetoric.notable_phrases);

    let strategy = &analysis.strategy_analysis;
    section("Strategy");
    field("Opening", &strategy.opening_effectiveness);
    field("Counterarguments", &strategy.counterargument_handling);
    field("Time management", &strategy.time_management);
    field("Overall", &strategy.overall_strategy);

    let improvements = &analysis.improvement_areas;
    section("Improvements");
    bullets("Priorities", &improvements.priority_improvements);
    bullets("Practice", &improvements.practice_suggestions);
    bullets("Examples", &improvements.specific_examples);

    let overall = &analysis.overall_assessment;
    section("Overall");
    bullets("Strengths", &overall.key_strengths);
    bullets("Learning points", &overall.learning_points);
    println!(
        "  {} {}",
        "Effectiveness:".bold(),
        format!("{}/10", overall.effectiveness_score).bright_green().bold()
    );
    println!();
    for line in textwrap(&overall.summary, 66).lines() {
        println!("  {}", line);
    }
    println!();
}

async fn token(config: Config, args: DebateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context = args.context()?;
    let issuer = HttpCredentialIssuer::new(config, api_key())?;
    let credential = issuer.issue(Some(&context)).await?;
    println!("{}", credential);
    Ok(())
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        if current_line_len + word.len() + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textwrap() {
        let wrapped = textwrap("one two three four", 9);
        assert_eq!(wrapped, "one two\nthree\nfour");
        assert_eq!(textwrap("", 10), "");
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "debatecoach",
            "replay",
            "events.jsonl",
            "--topic",
            "Tariffs",
            "--stance",
            "against",
            "--say",
            "Hello",
            "--say",
            "Ready",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.say, vec!["Hello", "Ready"]);
        let ctx = args.debate.context().unwrap();
        assert_eq!(ctx.stance, Stance::Against);
        assert_eq!(ctx.username, "User");
    }

    #[test]
    fn test_bad_stance_is_rejected() {
        let args = DebateArgs {
            topic: "t".into(),
            stance: "maybe".into(),
            name: "n".into(),
        };
        assert!(args.context().is_err());
    }
}
