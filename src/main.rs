//! Nerva CLI - local-first assistant core

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use nerva::dispatch::{Clarifier, Dispatcher, TaskContext, TaskStatus};
use nerva::error::FixSuggestion;
use nerva::frontend::ambient::AmbientMonitor;
use nerva::frontend::voice::{VoiceFrontend, DEFAULT_MAX_MS, DEFAULT_SILENCE_MS};
use nerva::frontend::{Asr, Tts};
use nerva::persist::Persistence;
use nerva::skills::{default_registry, Skill as _, SkillDeps};
use nerva::{NervaConfig, NervaError};

#[derive(Parser)]
#[command(name = "nerva")]
#[command(about = "Nerva - local-first assistant core")]
#[command(version)]
struct Cli {
    /// Use scripted mock collaborators instead of the gateway and browser
    #[arg(long, global = true)]
    offline: bool,

    /// Skip loading and saving state under the nerva home
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch one text request
    Dispatch {
        /// The request, e.g. "summarize my inbox"
        utterance: Vec<String>,

        /// Attach the request to this project thread
        #[arg(short, long)]
        project: Option<String>,

        /// Pre-confirm risky requests (no interactive confirmation)
        #[arg(short, long)]
        yes: bool,
    },

    /// Conversational voice loop (console fallback when no speech engine)
    Voice {
        /// Skip the wake word and always listen
        #[arg(long)]
        barge_in: bool,

        /// End-of-utterance silence window in milliseconds
        #[arg(long, default_value_t = DEFAULT_SILENCE_MS)]
        silence: u64,

        /// Hard cap per capture in milliseconds
        #[arg(long, default_value_t = DEFAULT_MAX_MS)]
        max: u64,
    },

    /// Run a task on a timer until interrupted
    Ambient {
        /// The request to dispatch every interval
        #[arg(short, long)]
        task: String,

        /// Interval, e.g. "30s", "5m", "1h"
        #[arg(short, long)]
        every: String,
    },

    /// Run the daily-ops collection once
    Daily,

    /// Ask a question about known repositories
    Repo {
        question: Vec<String>,
    },

    /// List registered skills and their routing rules
    Skills,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, NervaError> {
    let config = NervaConfig::load()?;
    let persist = config.persist && !cli.ephemeral;

    let deps = if cli.offline {
        SkillDeps::offline(config.clone())
    } else {
        SkillDeps::production(
            config.clone(),
            Arc::new(nerva::browser::UnconfiguredLauncher),
        )
    };

    let persistence = Persistence::from_config(&config);
    if persist {
        persistence.load(&deps.memory, &deps.threads, &deps.graph)?;
    }

    let registry = default_registry(&deps);
    let dispatcher = Arc::new(Dispatcher::new(&deps, registry));

    // Ctrl-C cancels in-flight work; the exit code contract reports 130.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });

    let code = match cli.command {
        Commands::Dispatch {
            utterance,
            project,
            yes,
        } => {
            let mut task = TaskContext::text(utterance.join(" "));
            if let Some(project) = project {
                task = task.with_metadata("project", json!(project));
            }
            if yes {
                task = task.with_metadata("confirmed", json!(true));
            }
            run_dispatch(&dispatcher, task, cancel).await
        }

        Commands::Voice {
            barge_in,
            silence,
            max,
        } => {
            let frontend = VoiceFrontend::new(
                Arc::clone(&dispatcher),
                Arc::new(ConsoleAsr),
                Arc::new(ConsoleTts),
            )
            .with_timing(silence, max);
            // The console fallback has no wake-word detector; --barge-in is
            // the only mode either way.
            let _ = barge_in;
            let turns = frontend.run(cancel.clone()).await;
            println!("{} {} turns", "Done:".cyan(), turns);
            if cancel.is_cancelled() {
                130
            } else {
                0
            }
        }

        Commands::Ambient { task, every } => {
            let interval = parse_duration(&every).ok_or_else(|| NervaError::Config {
                reason: format!("cannot parse interval '{}'", every),
            })?;
            println!(
                "{} running '{}' every {:?} (Ctrl-C to stop)",
                "→".cyan(),
                task,
                interval
            );
            let monitor = AmbientMonitor::new(Arc::clone(&dispatcher), task, interval);
            let handle = monitor.spawn();
            cancel.cancelled().await;
            let ticks = handle.stop().await;
            println!("{} {} ticks completed", "Done:".cyan(), ticks);
            130
        }

        Commands::Daily => {
            let task = TaskContext::text("collect the daily operations summary")
                .with_metadata("skill", json!("daily_ops"));
            run_dispatch(&dispatcher, task, cancel).await
        }

        Commands::Repo { question } => {
            let task = TaskContext::text(question.join(" "))
                .with_metadata("skill", json!("repo_query"));
            run_dispatch(&dispatcher, task, cancel).await
        }

        Commands::Skills => {
            for skill in dispatcher.registry().iter() {
                println!(
                    "{:<16} {}",
                    skill.name().cyan().bold(),
                    skill.description()
                );
                if !skill.keywords().is_empty() {
                    println!("{:<16} rules: {}", "", skill.keywords().join("  "));
                }
            }
            0
        }
    };

    if persist {
        persistence.save(&deps.memory, &deps.threads, &deps.graph)?;
    }

    Ok(code)
}

async fn run_dispatch(
    dispatcher: &Arc<Dispatcher>,
    task: TaskContext,
    cancel: CancellationToken,
) -> i32 {
    let result = dispatcher
        .dispatch_with(task, &StdinClarifier, cancel)
        .await;

    match result.status {
        TaskStatus::Ok => {
            println!("{} {}", "✓".green(), result.summary);
            if let Some(answer) = &result.answer {
                if answer != &result.summary {
                    println!("{}", answer);
                }
            }
        }
        TaskStatus::ClarificationNeeded => {
            println!("{} {}", "?".yellow(), result.summary);
        }
        TaskStatus::Refused => {
            println!("{} {}", "✗".red(), result.summary);
        }
        TaskStatus::Failed => {
            println!("{} {}", "✗".red(), result.summary);
            if let Some(screenshot) = result
                .artifacts
                .keys()
                .filter(|k| k.starts_with("screenshot"))
                .next_back()
            {
                println!("  last screenshot artifact: {}", screenshot);
            }
        }
    }

    result.exit_code()
}

/// Text-channel clarifier: prints the question, reads one line from stdin.
struct StdinClarifier;

#[async_trait]
impl Clarifier for StdinClarifier {
    async fn ask(&self, question: &str) -> Option<String> {
        println!("{} {}", "?".yellow().bold(), question);
        read_line().await
    }
}

/// Console stand-ins for the speech engines: stdin is the microphone,
/// stdout the speaker. Real ASR/TTS plug in through the same traits.
struct ConsoleAsr;

#[async_trait]
impl Asr for ConsoleAsr {
    async fn transcribe_until_silence(
        &self,
        _silence_ms: u64,
        _max_ms: u64,
    ) -> Result<String, NervaError> {
        print!("{} ", "you>".cyan());
        use std::io::Write;
        let _ = std::io::stdout().flush();
        Ok(read_line().await.unwrap_or_else(|| "exit".to_string()))
    }
}

struct ConsoleTts;

#[async_trait]
impl Tts for ConsoleTts {
    async fn speak(&self, text: &str, _blocking: bool) -> Result<(), NervaError> {
        println!("{} {}", "nerva>".green(), text);
        Ok(())
    }
}

async fn read_line() -> Option<String> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    match reader.read_line(&mut line).await {
        Ok(0) => None, // EOF
        Ok(_) => Some(line.trim().to_string()),
        Err(_) => None,
    }
}

/// Parse "30", "30s", "5m", "1h", "500ms" into a Duration.
fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}
