//! rowtrail - one-shot provisioning run
//!
//! Loads settings, connects to the target database, and runs the
//! provisioning pipeline. The exit status reflects run-fatal errors only;
//! per-table failures are reported and counted without failing the process.

use rowtrail::config::Settings;
use rowtrail::db;
use rowtrail::orchestrator::Orchestrator;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting rowtrail provisioning run");

    let settings = Settings::load()?;
    let pool = db::init_pool(&settings).await?;

    let orchestrator = Orchestrator::new(pool, settings);
    let report = orchestrator.run().await?;

    debug!("Run report: {}", serde_json::to_string_pretty(&report)?);

    if report.failure_count > 0 {
        warn!(
            "Provisioning finished with {} failed operations across {} tables; see the log above for details",
            report.failure_count,
            report.failed_tables()
        );
    } else {
        info!("Provisioning finished without errors");
    }

    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rowtrail=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}
