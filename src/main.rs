// src/main.rs
use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;

use signal_streamer::config::Settings;
use signal_streamer::orchestrator::Orchestrator;

/// Realtime market update channel client.
#[derive(Debug, Parser)]
#[command(name = "signal-streamer")]
struct Cli {
    /// Override the stream endpoint from Settings.toml.
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let mut settings = Settings::new()?;
    if let Some(url) = cli.url {
        settings.stream.url = url;
    }

    let mut orchestrator = Orchestrator::new(&settings).await?;
    orchestrator.setup_update_monitor().await?;

    orchestrator.run().await?;

    Ok(())
}
