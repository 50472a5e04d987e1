use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use crate::config::{AssistConfig, CliOverrides, FileConfig, load_config};

#[derive(Parser)]
#[command(name = "assist")]
#[command(about = "Terminal panel for an AI assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.assist)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the panel (default)
    Run(RunArgs),

    /// Print the resolved configuration as TOML
    Config(RunArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Backend WebSocket endpoint
    #[arg(long)]
    ws_url: Option<String>,

    /// Backend HTTP base URL (for /start)
    #[arg(long)]
    base_url: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            ws_url: self.ws_url.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout belongs to the panel.
    let default_directive = if cli.debug {
        "assist=debug,assist_host=debug,assist_session=debug,warn"
    } else {
        "assist=info,assist_host=info,assist_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = AssistConfig::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_panel(&config, RunArgs::default()).await,
        Some(Commands::Run(args)) => run_panel(&config, args).await,
        Some(Commands::Config(args)) => {
            let file_config = resolve(&config, &args)?;
            let rendered =
                toml::to_string_pretty(&file_config).context("Failed to render config")?;
            println!("# {}", config.config_toml_path().display());
            print!("{rendered}");
            Ok(())
        }
    }
}

fn resolve(config: &AssistConfig, args: &RunArgs) -> Result<FileConfig> {
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    Ok(file_config.apply_overrides(&args.overrides()))
}

async fn run_panel(config: &AssistConfig, args: RunArgs) -> Result<()> {
    let file_config = resolve(config, &args)?;
    info!("Starting assist panel");
    cli::run(config, &file_config).await
}
