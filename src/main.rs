//! SchoolRide - Cycling Distance Tracker for Schools
//!
//! Main entry point: loads configuration, opens the database and runs the
//! periodic reconcile/expire worker plus the config refresh task.

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use schoolride::scheduler::{run_config_refresh, Scheduler};
use schoolride::storage::{config, Database, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config().context("failed to load configuration")?;

    // Env filter wins over the config file; the reload handle lets the
    // refresh task retarget verbosity at runtime.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&app_config.log_filter));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SchoolRide v{}", env!("CARGO_PKG_VERSION"));

    let db_path = app_config.database_path();
    Settings::init(app_config);

    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let db = schoolride::storage::shared(db);

    tokio::spawn(run_config_refresh(reload_handle));

    Scheduler::new(db).run().await;

    Ok(())
}
