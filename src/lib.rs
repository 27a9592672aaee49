pub mod cli;
pub mod clients;
pub mod config;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod feedback;
pub mod models;
pub mod providers;
pub mod registry;
pub mod services;
pub mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{AppContext, Cli, Commands};
pub use config::Config;
use feedback::Feedback;

pub async fn run() -> Result<()> {
    let config = Config::load()?;
    run_with_config(config).await
}

pub async fn run_with_config(config: Config) -> Result<()> {
    config.validate()?;
    init_logging(&config)?;

    let cli = Cli::parse();
    execute_command(cli, config).await
}

fn init_logging(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

async fn execute_command(cli: Cli, config: Config) -> Result<()> {
    if cli.resume {
        let feedback = Feedback::new(config.general.icons);
        cli::restore_session(&config, &feedback);
    }

    match cli.command {
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }

        Some(Commands::Init) => {
            if Config::create_default_if_missing()? {
                println!(
                    "✓ Config file created at {}. Edit it and run again.",
                    Config::default_config_path().display()
                );
            } else {
                println!("Config file already exists.");
            }
            Ok(())
        }

        Some(Commands::Auth { command }) => cli::cmd_auth(&config, command).await,

        Some(command) => {
            let ctx = AppContext::build(config)
                .await
                .context("failed to initialize services")?;
            match command {
                Commands::Daemon => {
                    info!("torii v{} starting in daemon mode", env!("CARGO_PKG_VERSION"));
                    cli::cmd_daemon(&ctx).await
                }
                Commands::Search { query, page } => cli::cmd_search(&ctx, query, page).await,
                Commands::Play {
                    query,
                    id,
                    episode,
                    local,
                } => cli::cmd_play(&ctx, query, id, episode, local).await,
                Commands::Download {
                    query,
                    id,
                    episode_range,
                    yes,
                } => cli::cmd_download(&ctx, query, id, &episode_range, yes).await,
                Commands::Queue { command } => cli::cmd_queue(&ctx, command).await,
                Commands::Registry { command } => cli::cmd_registry(&ctx, command).await,
                Commands::Notifications => cli::cmd_notifications(&ctx).await,
                Commands::Init | Commands::Auth { .. } => unreachable!("handled above"),
            }
        }
    }
}
