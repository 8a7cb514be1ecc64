// Crucible - main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crucible::config::load_config;
use crucible::evolve::{EngineConfig, EvolutionEngine};
use crucible::gateway::{CliBackend, Gateway};
use crucible::registry::TaskRegistry;
use crucible::server::{self, AppState};
use crucible::session::SessionStore;

#[derive(Parser)]
#[command(name = "crucible", version, about = "Control plane for a code-generation CLI")]
struct Cli {
    /// Path to the config file (defaults to ~/.crucible/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Check that the external tool is installed and responding
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let sessions = Arc::new(SessionStore::new());
    let backend = Arc::new(CliBackend::new(config.tool.binary.clone()));
    let gateway = Arc::new(Gateway::new(backend, Arc::clone(&sessions)));

    match cli.command {
        Command::Serve { bind } => {
            let engine = Arc::new(EvolutionEngine::new(
                Arc::clone(&gateway),
                Arc::clone(&sessions),
                EngineConfig {
                    invoke_timeout: Duration::from_secs(config.tool.timeout_secs),
                    verify_timeout: Duration::from_secs(config.evolve.verify_timeout_secs),
                    default_tier: config.tool.primary_tier.clone(),
                    fallback_tier: config.tool.fallback_tier.clone(),
                    default_capabilities: config.tool.default_capabilities.clone(),
                },
            ));
            let registry = Arc::new(TaskRegistry::new(engine, Arc::clone(&sessions)));

            let bind_address = bind.unwrap_or_else(|| config.server.bind_address.clone());
            let state = AppState::new(&config, gateway, sessions, registry);
            server::serve(state, &bind_address).await
        }
        Command::Check => {
            if gateway.health_check().await {
                println!("tool '{}' is available", config.tool.binary);
                Ok(())
            } else {
                anyhow::bail!("tool '{}' is not responding", config.tool.binary)
            }
        }
    }
}
