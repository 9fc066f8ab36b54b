//! ineacquire - statistics portal dataset acquisition.

use std::process::ExitCode;

use ineacquire::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // RUST_LOG wins, then LOG_LEVEL, then verbosity
    let default_filter = match std::env::var("LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => format!("ineacquire={}", level.trim()),
        _ if cli::is_verbose() => "ineacquire=info".to_string(),
        _ => "ineacquire=warn".to_string(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
