use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fine_tracker_cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fine_tracker_scraper=info,fine_tracker_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    fine_tracker_cli::run_cli(Cli::parse()).await
}
