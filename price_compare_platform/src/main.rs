//! Main entry point for the price comparison CLI.

use anyhow::Result;
use clap::Parser;
use price_compare_platform::{
    cli, orchestrator::Orchestrator, refresher::PeriodicRefresher, server,
    settings::Settings, store, telemetry, StatusReport, SubmitOutcome,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load()?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve { addr } => server::serve(settings, addr).await,
        cli::Commands::Search { query, requester } => search(&settings, &query, &requester).await,
        cli::Commands::RefreshOnce => {
            let store = store::open(&settings.store)?;
            let persisted = PeriodicRefresher::from_config(&settings.refresher, store)
                .run_cycle()
                .await?;
            info!("Refresh cycle persisted {} coupons", persisted);
            Ok(())
        }
        cli::Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn search(settings: &Settings, query: &str, requester: &str) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings);

    let task_id = match orchestrator.submit_query(requester, query) {
        SubmitOutcome::Success { items, .. } => {
            println!("{} products (cached)", items.len());
            return Ok(());
        }
        SubmitOutcome::Pending { task_id } => task_id,
    };

    let (incremental, report) = orchestrator.poll_until_terminal(requester, task_id).await?;
    info!("Received {} incremental items before completion", incremental.len());

    match report {
        StatusReport::Success { items, filters } => {
            println!("{} products for '{}'", items.len(), query);
            for item in items.iter() {
                println!("  {:>10.2}  {:<14} {}", item.price, item.store, item.name);
            }
            println!("stores: {}", filters.stores.join(", "));
            println!("price range: {} - {}", filters.min_price, filters.max_price);
            Ok(())
        }
        StatusReport::Error { message } => Err(anyhow::anyhow!(message)),
        other => Err(anyhow::anyhow!("task ended in unexpected state {:?}", other.status())),
    }
}
