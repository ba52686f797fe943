//! Error handling module
//!
//! Provides the error taxonomy for a provisioning run. Errors are split into
//! run-fatal conditions (the run aborts before or during bootstrap) and
//! per-table failures (recorded in the run report while the run continues).

use thiserror::Error;

/// Application-wide error type for a provisioning run
#[derive(Error, Debug)]
pub enum AuditError {
    /// Catalog introspection failed; nothing can be provisioned.
    #[error("Catalog discovery failed: {0}")]
    Discovery(#[source] tokio_postgres::Error),

    /// A required session-level setting is absent from the target database.
    #[error("Required database setting `{0}` is not defined (run: ALTER DATABASE ... SET {0} TO '')")]
    Prereq(String),

    /// The configured include/exclude filters are malformed.
    #[error("Malformed audit policy: {0}")]
    Policy(String),

    /// A shared audit structure (audit schema, history table, guard function)
    /// could not be created. Nothing table-specific has happened yet.
    #[error("Bootstrap failed at {step}: {source}")]
    Bootstrap {
        step: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Log-table or capture-hook installation failed for one table.
    #[error("Structural change failed for {table}: {source}")]
    Structural {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// One derived view failed to build. The other views are unaffected.
    #[error("View build failed for {view}: {source}")]
    View {
        view: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

impl AuditError {
    /// Whether this error aborts the whole run.
    ///
    /// Per-table structural and view failures are recorded and counted; the
    /// orchestrator moves on to the next table. Everything else means the
    /// session or the shared audit structures are unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AuditError::Structural { .. } | AuditError::View { .. })
    }
}

/// Result type alias used throughout the pipeline
pub type AuditResult<T> = Result<T, AuditError>;
