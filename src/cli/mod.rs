//! CLI commands for Switchboard using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channel::{ConsoleDelivery, Delivery, InboundMessage, OperatorReporter};
use crate::config::{get_settings_path, load_settings, load_settings_or_default, Settings};
use crate::core::{Collaborators, Router, Switchboard};
use crate::followup::LogExporter;
use crate::providers::create_backend;
use crate::store::sqlite::SqliteStore;

/// Session id used by the local console.
const CONSOLE_SESSION: &str = "console";

/// Switchboard - per-user message router between a chat channel and reasoning agents.
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = "0.1.0")]
#[command(about = "Switchboard - route chat users to reasoning agents", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the Telegram daemon
    Run,

    /// Talk to the agents from this terminal
    Chat {
        /// Keep session state in memory instead of the configured database
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show how a reply text would be routed
    Route {
        /// Agent reply text
        text: String,
    },

    /// Show the settings path and effective settings
    Config,

    /// Show recent log lines
    Logs {
        /// Only lines containing this text (case-insensitive)
        #[arg(default_value = "all")]
        filter: String,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Run => cmd_run().await,
            Command::Chat { ephemeral } => cmd_chat(*ephemeral).await,
            Command::Route { text } => cmd_route(text).await,
            Command::Config => cmd_config().await,
            Command::Logs { filter } => cmd_logs(filter).await,
        }
    }
}

// Command implementations

async fn cmd_run() -> Result<()> {
    use crate::telegram::run_telegram_daemon;

    // Reject startup early when the roster or reconnection config is invalid.
    let settings = load_settings()?;
    println!("Starting Switchboard Telegram daemon...");
    run_telegram_daemon(settings).await?;
    Ok(())
}

async fn cmd_chat(ephemeral: bool) -> Result<()> {
    let settings = load_settings_or_default();

    let store = Arc::new(if ephemeral {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(&settings.storage.resolve_database_path()?)?
    });
    let delivery: Arc<dyn Delivery> = Arc::new(ConsoleDelivery);
    let reporter = Arc::new(OperatorReporter::new(
        Arc::clone(&delivery),
        settings.channels.operator_chat.clone(),
    ));

    let switchboard = Switchboard::new(
        &settings,
        Collaborators {
            backend: create_backend(&settings)?,
            delivery,
            reporter,
            data: store.clone(),
            calendar: store.clone(),
            store,
            exporter: Arc::new(LogExporter),
        },
    );

    let resumed = switchboard.resume_reconnections().await?;
    if resumed > 0 {
        tracing::info!("Resumed {} reconnection cycle(s)", resumed);
    }

    println!(
        "Chatting as '{}' with {} (#reset to start over, Ctrl-D to quit)",
        CONSOLE_SESSION, settings.routing.default_agent
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(id) = switchboard.accept(InboundMessage::text(CONSOLE_SESSION, &line)) {
            tracing::debug!("Console message queued as {}", id);
        }
    }

    // Let queued turns finish before the runtime goes away.
    while !switchboard.queue.active_sessions().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("Bye.");
    Ok(())
}

async fn cmd_route(text: &str) -> Result<()> {
    let settings = load_settings_or_default();
    let router = Router::from_settings(&settings);

    match router.classify(text) {
        Some(decision) => {
            println!("Decision: {}", decision.as_str());
            println!("Summary:  {}", router.extract_summary(text));
            let visible = router.strip_routing_artifacts(text);
            if !visible.is_empty() {
                println!("Visible:\n{}", visible);
            }
        }
        None => println!("Decision: none (reply stays with the current agent)"),
    }
    Ok(())
}

async fn cmd_config() -> Result<()> {
    let path = get_settings_path()?;
    let (settings, source) = if path.exists() {
        (load_settings()?, "file")
    } else {
        (Settings::default(), "defaults")
    };

    println!("Settings path: {} ({})", path.display(), source);
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

async fn cmd_logs(filter: &str) -> Result<()> {
    let log_dir = crate::logging::get_log_dir()?;
    if !log_dir.exists() {
        println!("Log directory not found: {}", log_dir.display());
        return Ok(());
    }

    // Daily rolling files are named switchboard.log.YYYY-MM-DD.
    let mut files: Vec<_> = std::fs::read_dir(&log_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("switchboard.log"))
        })
        .collect();
    files.sort();
    let Some(file) = files.last() else {
        println!("No log files in {}", log_dir.display());
        return Ok(());
    };

    let content = std::fs::read_to_string(file)?;
    let mut lines: Vec<&str> = content.lines().collect();
    if filter != "all" {
        let needle = filter.to_lowercase();
        lines.retain(|l| l.to_lowercase().contains(&needle));
    }
    let start = lines.len().saturating_sub(120);
    for line in &lines[start..] {
        println!("{}", line);
    }
    Ok(())
}
