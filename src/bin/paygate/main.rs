//! paygate CLI entry point.

mod cli;

use clap::Parser;
use cli::Cli;
use paygate::{GatewayBuilder, RevenueReport};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("paygate v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = cli.into_config()?;

    // Build and run the gateway
    let mut gateway = GatewayBuilder::new(config).build().await?;

    // Run until shutdown
    gateway.run().await?;

    // Final revenue summary from the journal
    if let Ok(report) = RevenueReport::from_journal(gateway.journal()) {
        info!(
            "lifetime totals: {} settled ({} micro-USDC), {} refunded, {} agents",
            report.settled, report.gross_revenue, report.refunded, report.unique_agents
        );
    }

    info!("Goodbye!");
    Ok(())
}
