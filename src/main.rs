use anyhow::Result;
use clap::Parser;
use shufflefs::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => shufflefs::cli::init::write_default_config(&path)?,
        Commands::Patterns => shufflefs::cli::patterns::list_patterns(),
        Commands::Replay { config, trace } => {
            shufflefs::cli::replay::replay_trace(config.as_deref(), &trace).await?
        }
    }

    Ok(())
}
