//! mcpcheck CLI - Recording proxies and assertion checks for agent runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcpcheck_core::assertions::{AssertionSpec, Verdict, evaluate};
use mcpcheck_core::config::McpConfig;
use mcpcheck_core::history::CallHistory;
use mcpcheck_core::proxy::ServerManager;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mcpcheck")]
#[command(about = "Record agent MCP traffic and check it against assertions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recording proxies until interrupted
    Proxy {
        /// Server configuration (YAML, JSON or TOML)
        #[arg(short, long, env = "MCPCHECK_CONFIG")]
        config: PathBuf,

        /// Where to save the recorded call history
        #[arg(long)]
        history_out: Option<PathBuf>,

        /// Where to write the configuration agents should use (.yaml or .json)
        #[arg(long)]
        agent_config_out: Option<PathBuf>,
    },
    /// Check a recorded history against an assertion document
    Verify {
        /// Recorded call history (JSON lines)
        #[arg(long)]
        history: PathBuf,

        /// Assertion document (YAML, JSON or TOML)
        #[arg(short, long)]
        assertions: PathBuf,

        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries endpoints and verdicts
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("mcpcheck {}", env!("CARGO_PKG_VERSION"));
            println!("mcpcheck-core {}", mcpcheck_core::VERSION);
        }
        Commands::Proxy {
            config,
            history_out,
            agent_config_out,
        } => run_proxy(config, history_out, agent_config_out).await?,
        Commands::Verify {
            history,
            assertions,
            json,
        } => {
            let passed = verify(history, assertions, json)?;
            if !passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_proxy(
    config_path: PathBuf,
    history_out: Option<PathBuf>,
    agent_config_out: Option<PathBuf>,
) -> Result<()> {
    let config = McpConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });
    }

    let manager = ServerManager::start(&config).await?;
    manager.wait_ready(&interrupt).await?;

    for (server, url) in manager.endpoints() {
        println!("{}\t{}", server, url);
    }

    if let Some(path) = &agent_config_out {
        manager
            .agent_config()
            .save(path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Wrote agent configuration");
    }

    interrupt.cancelled().await;
    info!("Interrupted, shutting down");

    let recorder = manager.recorder().clone();
    let shutdown = manager.shutdown().await;
    let history = match &shutdown {
        Ok(history) => history.clone(),
        Err(e) => {
            warn!("{}", e);
            recorder.snapshot()
        }
    };

    info!(calls = history.len(), "Recording finished");
    if let Some(path) = &history_out {
        history
            .save(path)
            .with_context(|| format!("saving history to {}", path.display()))?;
        info!(path = %path.display(), "Saved call history");
    }

    shutdown.map(|_| ()).map_err(Into::into)
}

fn verify(history_path: PathBuf, assertions_path: PathBuf, json: bool) -> Result<bool> {
    let history = CallHistory::load(&history_path)
        .with_context(|| format!("loading {}", history_path.display()))?;
    let spec = AssertionSpec::from_file(&assertions_path)
        .with_context(|| format!("loading {}", assertions_path.display()))?;

    let verdict = Verdict::from(evaluate(&history, &spec));
    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print!("{}", verdict.summary());
    }
    Ok(verdict.passed)
}
