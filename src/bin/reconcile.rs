//! Operational reconciliation tool: audits stock counters, repairs drift,
//! and re-syncs reservations with open orders.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockline::config::AppConfig;
use stockline::db;
use stockline::services::SYSTEM_ACTOR_ID;
use stockline::AppServices;

#[derive(Parser)]
#[command(name = "reconcile", about = "Stock consistency reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit all stock records and report violations.
    Validate,
    /// Repair drifted reserved-stock caches.
    Fix,
    /// Re-run reservation allocation for every open order.
    Sync,
    /// Print stock health counts.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let db_config = db::DbConfig::from_app_config(&config);
    let pool = db::establish_connection_with_config(&db_config)
        .await
        .context("failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let services = AppServices::new(Arc::new(pool), None, config.stock.clone());

    match cli.command {
        Command::Validate => {
            let report = services.consistency.validate_all_stock().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Fix => {
            let report = services
                .consistency
                .fix_stock_inconsistencies(SYSTEM_ACTOR_ID)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sync => {
            let report = services
                .consistency
                .sync_reservations_with_orders(SYSTEM_ACTOR_ID)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = services.consistency.get_stock_statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    info!("reconcile finished");
    Ok(())
}
