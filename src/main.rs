//! foundry CLI entry point.
//!
//! Loads `.env`, initializes logging and delegates to the CLI module for
//! command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Credentials may live in .env; a missing file is fine
    let _ = dotenvy::dotenv();

    // Parse CLI arguments first to get log_level
    let cli = foundry::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level > advanced.log_level > "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_filter());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    foundry::cli::run_with_cli(cli).await
}
