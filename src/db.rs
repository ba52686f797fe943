//! Database connection module
//!
//! Builds the connection pool for the target database and prepares each
//! session for provisioning work: the configured lock-acquisition timeout is
//! applied to every pooled connection, and the required `rowtrail.changed_by`
//! setting is verified before any structural change is attempted.

use crate::config::Settings;
use crate::error::{AuditError, AuditResult};
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod};
use tracing::info;

/// The runtime parameter the capture function reads to attribute changes.
///
/// Must be defined at the database level (`ALTER DATABASE ... SET
/// rowtrail.changed_by TO ''`) before provisioning; applications override it
/// per session or per transaction.
pub const CHANGED_BY_SETTING: &str = "rowtrail.changed_by";

/// Create the connection pool from settings.
///
/// The lock timeout rides along as a connection option so every session the
/// pool hands out is bounded the same way; an administrative run must neither
/// block behind live traffic indefinitely nor hold it up.
pub async fn init_pool(settings: &Settings) -> anyhow::Result<Pool> {
    let db = &settings.database;

    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(db.host.clone());
    cfg.port = Some(db.port);
    cfg.user = Some(db.user.clone());
    cfg.password = Some(db.password.clone());
    cfg.dbname = Some(db.database.clone());
    cfg.options = Some(format!(
        "-c lock_timeout={}ms",
        settings.policy.lock_timeout_ms.0
    ));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(db.max_pool_size));

    let pool = if db.use_tls() {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    // Verify the connection works before handing the pool to the orchestrator.
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1 AS ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!(
        "Connected to {} at {}:{} (TLS: {})",
        db.database,
        db.host,
        db.port,
        db.use_tls()
    );
    Ok(pool)
}

/// Verify that the `rowtrail.changed_by` runtime parameter exists.
///
/// The capture function reads it on every write; a database where it is
/// undefined would start failing application DML the moment a trigger fires.
/// Checked up front so the run aborts before any structural change.
pub async fn ensure_changed_by_setting(client: &tokio_postgres::Client) -> AuditResult<()> {
    let probe = format!("SELECT current_setting('{}')", CHANGED_BY_SETTING);
    client
        .query_one(&probe, &[])
        .await
        .map_err(|_| AuditError::Prereq(CHANGED_BY_SETTING.to_string()))?;

    info!("{} found", CHANGED_BY_SETTING);
    Ok(())
}
