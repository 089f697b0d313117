use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use readmebot_backend::{config, serve};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Migrate {
        #[clap(default_value = "readmebot.toml")]
        config_path: PathBuf,
    },
    Serve {
        #[clap(default_value = "readmebot.toml")]
        config_path: PathBuf,
    },
}

fn main() -> Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to set default TLS provider");

    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(sentry_tracing::layer())
        .with(tracing_error::ErrorLayer::default())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config_path } => {
            tracing::info!("Starting server with {}", config_path.display());
            let config = config::Config::new(&config_path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            serve::main(config)?
        }
        Commands::Migrate { config_path } => {
            tracing::info!("Running migrations with {}", config_path.display());
            let config = config::Config::new(&config_path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    tracing::error!("Failed to create Tokio runtime: {}", e);
                    eyre::eyre!("Failed to create Tokio runtime: {}", e)
                })?;

            runtime.block_on(async {
                let app_state = config::AppState::new(config).await?;
                app_state.run_migrations().await
            })?;

            tracing::info!("Migrations completed successfully");
        }
    };

    Ok(())
}
