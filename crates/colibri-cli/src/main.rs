//! Colibri CLI
//!
//! Command-line interface for the Colibri chatmail assistant

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colibri_chatmail::ChatmailAdapter;
use colibri_config::Config;
use colibri_core::BotRuntime;
use colibri_ipc::EventBus;
use colibri_providers::GeminiClient;
use colibri_storage::Storage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const DB_FILE: &str = "colibri.db";

#[derive(Parser)]
#[command(name = "colibri")]
#[command(about = "Chatmail assistant bot powered by Gemini", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground until ctrl-c
    Run,

    /// Write a commented sample config file
    InitConfig,
}

fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("could not determine config dir")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(&cli).await,
        Commands::InitConfig => init_config(&cli),
    }
}

fn init_config(cli: &Cli) -> Result<()> {
    let path = config_path(cli)?;
    if path.exists() {
        return Err(anyhow!("config already exists at {}", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::sample())?;
    println!("Wrote sample config to {}", path.display());
    println!("Set [gemini].api_key (or the GEMINI_API_KEY env var) before running.");
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let path = config_path(cli)?;
    let config = Config::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Colibri starting");

    let storage = Storage::new(data_dir.join(DB_FILE))
        .with_context(|| format!("failed to open database in {}", data_dir.display()))?;
    let backend = Arc::new(GeminiClient::new(&config.gemini));
    let adapter = Arc::new(ChatmailAdapter::new(&config).context("failed to start chatmail adapter")?);
    let bus = EventBus::new();

    let transport: Arc<dyn colibri_core::Transport> = adapter.clone();
    let runtime = BotRuntime::new(config, storage, backend, transport, bus.clone());

    let adapter_task = {
        let adapter = adapter.clone();
        let bus = bus.clone();
        tokio::spawn(async move { adapter.run(bus).await })
    };
    let runtime_task = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        result = adapter_task => {
            match result {
                Ok(Err(err)) => error!(error = %err, "Chatmail adapter stopped"),
                Err(err) => error!(error = %err, "Chatmail adapter task panicked"),
                Ok(Ok(())) => info!("Chatmail adapter finished"),
            }
        }
        result = runtime_task => {
            match result {
                Ok(Err(err)) => error!(error = %err, "Bot runtime stopped"),
                Err(err) => error!(error = %err, "Bot runtime task panicked"),
                Ok(Ok(())) => info!("Bot runtime finished"),
            }
        }
    }

    Ok(())
}
