mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Config => commands::config::run(cli.config.as_deref())?,
        Commands::Serve { addr } => commands::serve::run(cli.config.as_deref(), addr).await?,
        Commands::Scenario { action } => {
            commands::scenario::run(cli.config.as_deref(), action).await?;
        }
    }

    Ok(())
}
