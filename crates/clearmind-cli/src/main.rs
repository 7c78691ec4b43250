//! ClearMind CLI
//!
//! Thin wrapper around clearmind-sync for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create an account (linked when the API is reachable, local otherwise)
//! clearmind register me@example.com --password "correct horse"
//!
//! # Sign in / out
//! clearmind login me@example.com --password "correct horse"
//! clearmind logout
//!
//! # Journal a thought with the distortions it shows
//! clearmind thought add "I always mess things up" --distortion overgeneralization
//!
//! # List, edit and delete thoughts
//! clearmind thought list
//! clearmind thought edit 3 "I messed this one thing up"
//! clearmind thought delete 3
//!
//! # Record a finished exercise
//! clearmind exercise complete breathing-478
//!
//! # Push queued writes to the server
//! clearmind sync
//!
//! # Inspect queued writes
//! clearmind outbox
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clearmind_sync::network::TcpProbe;
use clearmind_sync::{
    EngineConfig, LocalId, LoggingBuilder, NetworkMonitor, NetworkStatus, ReachabilityProbe,
    SessionState, SyncEngine, SyncEvent,
};
use serde_json::Value;

/// ClearMind - offline-first thought journal
#[derive(Parser)]
#[command(name = "clearmind")]
#[command(version = "0.1.0")]
#[command(about = "ClearMind - offline-first thought journal")]
#[command(
    long_about = "Journal and analyze thoughts on this device, and sync them to the ClearMind service whenever it is reachable."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: platform data dir/clearmind)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Base URL of the journal API
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Treat the network as unreachable
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Register {
        email: String,
        #[arg(short, long)]
        password: String,
        /// Display name (defaults to the part of the email before '@')
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Sign in
    Login {
        email: String,
        #[arg(short, long)]
        password: String,
    },

    /// Sign out (journal data is kept)
    Logout,

    /// Show the active identity
    Whoami,

    /// Thought journal
    Thought {
        #[command(subcommand)]
        action: ThoughtAction,
    },

    /// CBT exercises
    Exercise {
        #[command(subcommand)]
        action: ExerciseAction,
    },

    /// Distortion counts across all thoughts
    Stats,

    /// Deliver queued writes to the server now
    Sync,

    /// List queued writes
    Outbox,
}

#[derive(Subcommand)]
enum ThoughtAction {
    /// Journal a new thought
    Add {
        text: String,
        /// Distortion identified in the thought (repeatable)
        #[arg(long = "distortion")]
        distortions: Vec<String>,
        /// Balanced alternative thought (repeatable)
        #[arg(long = "reframe")]
        reframes: Vec<String>,
    },
    /// List thoughts, newest first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Replace a thought's text and analysis
    Edit {
        id: u64,
        text: String,
        #[arg(long = "distortion")]
        distortions: Vec<String>,
        #[arg(long = "reframe")]
        reframes: Vec<String>,
    },
    /// Delete a thought
    Delete { id: u64 },
}

#[derive(Subcommand)]
enum ExerciseAction {
    /// Record a finished exercise
    Complete { exercise_id: String },
    /// List completed exercises
    List,
}

/// Map -v flags to a filter directive
fn log_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Get the default data directory (<platform data dir>/clearmind)
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clearmind")
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::new(default_data_dir()),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(api_url) = &cli.api_url {
        config.api_base_url = api_url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// One reachability check; the CLI does not keep a probe running.
async fn initial_status(config: &EngineConfig, offline: bool) -> Result<Option<NetworkStatus>> {
    if offline {
        return Ok(Some(NetworkStatus::Offline));
    }
    let probe = TcpProbe::from_base_url(&config.api_base_url, config.request_timeout())?;
    Ok(probe.check().await)
}

fn text_values(items: Vec<String>) -> Vec<Value> {
    items.into_iter().map(Value::String).collect()
}

fn print_session(state: &SessionState) {
    match state.user() {
        Some(user) => {
            println!("User: {} <{}>", user.display_name, user.email);
            println!("  ID: {}", user.id);
            println!("  Mode: {}", state.mode());
            if let Some(remote_id) = &user.remote_id {
                println!("  Remote ID: {}", remote_id);
            }
        }
        None => println!("Not signed in."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    LoggingBuilder::new(config.data_dir.join("logs"), "cli")
        .with_filter(log_filter(cli.verbose))
        .init()?;

    let network = NetworkMonitor::new(initial_status(&config, cli.offline).await?);
    let engine = SyncEngine::open(config, network)?;
    engine.restore_session().await;

    match cli.command {
        Commands::Register {
            email,
            password,
            name,
        } => {
            let state = engine.register(&email, &password, name.as_deref()).await?;
            println!("Registered {} ({})", email.trim(), state.mode());
            print_session(&state);
        }

        Commands::Login { email, password } => {
            let state = engine.login(&email, &password).await?;
            println!("Signed in ({})", state.mode());
            print_session(&state);
        }

        Commands::Logout => {
            engine.logout();
            println!("Signed out.");
        }

        Commands::Whoami => print_session(&engine.session()),

        Commands::Thought { action } => match action {
            ThoughtAction::Add {
                text,
                distortions,
                reframes,
            } => {
                let thought =
                    engine.save_thought(&text, text_values(distortions), text_values(reframes))?;
                println!("Thought saved.");
                println!("  ID: {}", thought.id);
                println!("  Status: {}", thought.sync_state);
            }
            ThoughtAction::List { limit } => {
                let thoughts = engine.list_thoughts(limit)?;
                if thoughts.is_empty() {
                    println!("No thoughts yet.");
                }
                for thought in thoughts {
                    println!(
                        "{}\t{}\t{}\t{}",
                        thought.id,
                        thought.created_at.format("%Y-%m-%d %H:%M"),
                        thought.sync_state,
                        thought.text
                    );
                }
            }
            ThoughtAction::Edit {
                id,
                text,
                distortions,
                reframes,
            } => {
                let thought = engine.edit_thought(
                    LocalId(id),
                    &text,
                    text_values(distortions),
                    text_values(reframes),
                )?;
                println!("Thought {} updated.", thought.id);
            }
            ThoughtAction::Delete { id } => {
                engine.delete_thought(LocalId(id))?;
                println!("Thought {} deleted.", id);
            }
        },

        Commands::Exercise { action } => match action {
            ExerciseAction::Complete { exercise_id } => {
                let completion = engine.complete_exercise(&exercise_id)?;
                println!("Exercise {} completed.", completion.exercise_id);
                println!("  ID: {}", completion.id);
            }
            ExerciseAction::List => {
                let completions = engine.list_completed_exercises()?;
                if completions.is_empty() {
                    println!("No exercises completed yet.");
                }
                for completion in completions {
                    println!(
                        "{}\t{}\t{}\t{}",
                        completion.id,
                        completion.completed_at.format("%Y-%m-%d %H:%M"),
                        completion.sync_state,
                        completion.exercise_id
                    );
                }
            }
        },

        Commands::Stats => {
            let stats = engine.distortion_stats()?;
            if stats.is_empty() {
                println!("No distortions recorded yet.");
            }
            for stat in stats {
                println!("{}\t{}", stat.count, stat.name);
            }
        }

        Commands::Sync => {
            let mut events = engine.subscribe();
            let result = engine.sync_now().await?;
            println!("Applied: {}", result.applied);
            println!("Failed: {}", result.failed);
            println!("Retained: {}", result.retained_for_retry);

            while let Ok(event) = events.try_recv() {
                if let SyncEvent::SyncFailure {
                    record,
                    method,
                    endpoint,
                    message,
                    ..
                } = event
                {
                    println!("  Rejected {} {} {}: {}", method, endpoint, record, message);
                }
            }
        }

        Commands::Outbox => {
            let entries = engine.pending_entries()?;
            if entries.is_empty() {
                println!("Outbox is empty.");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}\tattempts={}",
                    entry.id, entry.method, entry.endpoint, entry.record, entry.attempts
                );
            }
            match engine.last_synced_at()? {
                Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last sync: never"),
            }
        }
    }

    Ok(())
}
