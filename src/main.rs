use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use agentboard::config::AppConfig;
use agentboard::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "agentboard")]
#[command(
    version,
    about = "Drive GitHub Projects issues through per-column coding-agent pipelines"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding .agentboard/ and .env (defaults to the current directory)
    #[arg(long, global = true, env = "AGENTBOARD_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Explicit config file instead of .agentboard/agentboard.toml
    #[arg(long, global = true, env = "AGENTBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "pretty", env = "AGENTBOARD_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and WebSocket feed, and run the poller
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Project node ID to orchestrate (repeatable; replaces configured list)
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Seconds between poll cycles
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Allow cross-origin requests from any origin
        #[arg(long)]
        dev: bool,
    },
    /// Run the poller without the HTTP server
    Poll {
        /// Run a single cycle, print its report and exit
        #[arg(long)]
        once: bool,

        #[arg(long = "project")]
        projects: Vec<String>,

        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Create .agentboard/agentboard.toml and the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&project_dir, *force);
    }

    let mut config = AppConfig::resolve(&project_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            projects,
            poll_interval,
            dev,
        } => {
            cmd::Overrides {
                host,
                port,
                projects,
                poll_interval_secs: poll_interval,
                permissive_cors: dev,
            }
            .apply(&mut config);
            cmd::cmd_serve(config).await?;
        }
        Commands::Poll {
            once,
            projects,
            poll_interval,
        } => {
            cmd::Overrides {
                projects,
                poll_interval_secs: poll_interval,
                ..Default::default()
            }
            .apply(&mut config);
            cmd::cmd_poll(config, once).await?;
        }
        Commands::Config => cmd::cmd_config(&config)?,
        Commands::Init { .. } => {}
    }

    Ok(())
}
