use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mneme_core::{GenerateOptions, TextStreamer};
use mneme_engine::{MemoryError, MemoryManager, SummaryOutcome};
use mneme_llm::{open_stream, OllamaEmbedder, OllamaStreamer};
use mneme_settings::MnemeSettings;
use mneme_store::{migrations, Database};
use mneme_telemetry::TelemetryConfig;

const DEFAULT_PERSONA: &str = "You are a friendly conversational companion. Answer briefly.";

#[derive(Parser, Debug)]
#[command(name = "mneme", about = "Conversational memory core")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat on stdin/stdout with the configured Ollama models.
    Chat {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = DEFAULT_PERSONA)]
        persona: String,
    },
    /// Print a user's most recent messages.
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print a user's retained summaries.
    Summary {
        #[arg(long)]
        user: String,
        /// Generate a new summary first.
        #[arg(long)]
        now: bool,
    },
    /// Delete all messages, summaries and memories for a user.
    Clear {
        #[arg(long)]
        user: String,
    },
    /// Apply pending schema migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = mneme_settings::load_settings().unwrap_or_else(|e| {
        eprintln!("failed to load settings, using defaults: {e}");
        MnemeSettings::default()
    });
    if let Some(path) = &cli.db_path {
        settings.storage.db_path = path.display().to_string();
    }
    let _ = mneme_telemetry::init_telemetry(&TelemetryConfig::from_level(
        &settings.logging.level,
        settings.logging.json,
    ));
    if mneme_settings::init_settings(settings).is_err() {
        warn!("settings already initialised");
    }
    let settings = mneme_settings::get_settings();

    let db_path = PathBuf::from(settings.storage.resolved_db_path());
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    match cli.command {
        Command::Migrate => {
            let version = db.schema_version()?;
            println!(
                "{}: schema version {version} (latest {})",
                db_path.display(),
                migrations::latest_version()
            );
        }
        Command::History { user, limit } => {
            let manager = build_manager(db, settings)?;
            for message in manager.log().recent(&user, limit)? {
                println!(
                    "[{}] {} {}: {}",
                    message.sequence_id, message.created_at, message.role, message.content
                );
            }
        }
        Command::Summary { user, now } => {
            let manager = build_manager(db, settings)?;
            if now {
                match manager.summarize_now(&user).await {
                    SummaryOutcome::Stored(_) => {}
                    other => println!("no new summary: {other:?}"),
                }
            }
            let summaries = manager.log().summaries(&user)?;
            if summaries.is_empty() {
                println!("(no summary)");
            }
            for summary in summaries {
                println!("{} {}", summary.created_at, summary.text);
            }
        }
        Command::Clear { user } => {
            let manager = build_manager(db, settings)?;
            let report = manager.clear_all(&user)?;
            println!(
                "removed {} messages, {} summaries, {} memories",
                report.messages, report.summaries, report.memories
            );
        }
        Command::Chat { user, persona } => {
            let manager = build_manager(db, settings)?;
            let chat = OllamaStreamer::from_settings(&settings.generation)
                .context("failed to build chat client")?;
            run_chat(&manager, &chat, settings, &user, &persona).await?;
            manager.shutdown().await;
        }
    }
    Ok(())
}

fn build_manager(db: Database, settings: &MnemeSettings) -> Result<MemoryManager> {
    let embedder = OllamaEmbedder::from_settings(&settings.embedding)
        .context("failed to build embedding client")?;
    let summarizer = OllamaStreamer::from_settings(&settings.generation)
        .context("failed to build summarizer client")?;
    Ok(MemoryManager::new(
        db,
        Arc::new(embedder),
        Arc::new(summarizer),
        settings,
    ))
}

async fn run_chat(
    manager: &MemoryManager,
    chat: &dyn TextStreamer,
    settings: &MnemeSettings,
    user: &str,
    persona: &str,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let options = GenerateOptions::default();
    let deadline = Duration::from_millis(settings.generation.total_timeout_ms);
    info!(user, "chat started");

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if let Err(e) = manager.add_user_turn(user, text).await {
            eprintln!("could not record message: {e}");
            continue;
        }
        let context = match manager
            .build_context(user, persona, text, settings.context.window)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                eprintln!("could not read history: {e}");
                continue;
            }
        };

        // Ctrl-C during a turn cancels the reply; at the prompt it ends the chat.
        let cancel = CancellationToken::new();
        let turn = async {
            match open_stream(chat, &context, &options, &cancel, deadline).await {
                Ok(stream) => manager.collect_reply(stream, &cancel).await,
                Err(e) => Err(MemoryError::from(e)),
            }
        };
        tokio::pin!(turn);
        let reply = tokio::select! {
            reply = &mut turn => reply,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if e.is_cancelled() => {
                println!("(cancelled)");
                continue;
            }
            Err(MemoryError::EmptyGeneration) => {
                println!("{}", manager.empty_reply_message());
                continue;
            }
            Err(e) => {
                warn!(user, error = %e, "generation failed");
                println!("{}", manager.empty_reply_message());
                continue;
            }
        };
        println!("{reply}");

        if let Err(e) = manager.record_agent_reply(user, &reply).await {
            warn!(user, error = %e, "agent reply not recorded");
        }
        let _ = manager.maybe_schedule_summary(user);
    }

    info!(user, stats = ?manager.scheduler_stats(), "chat ended");
    Ok(())
}
