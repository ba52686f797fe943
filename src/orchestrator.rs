//! Provisioning Orchestrator
//!
//! Sequences discovery, policy evaluation, capture installation, and view
//! reconstruction over every candidate table, strictly one table at a time.
//! Per-table failures are recorded in the run report and never abort the
//! run; only missing preconditions, catalog failures, and bootstrap
//! structural failures do.

use crate::catalog::{CatalogReader, TableDescriptor};
use crate::config::Settings;
use crate::db;
use crate::error::{AuditError, AuditResult};
use crate::install::CaptureInstaller;
use crate::policy::PolicyEvaluator;
use crate::views::{self, ViewKind};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-table progress through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Discovered,
    Filtered,
    Installed,
    Reconstructed,
    Skipped,
    Failed,
}

impl TableState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TableState::Reconstructed | TableState::Skipped | TableState::Failed
        )
    }
}

/// Final outcome for one table
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub schema: String,
    pub table: String,
    pub state: TableState,
    /// Why the table was skipped, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// One entry per failed operation against this table.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl TableOutcome {
    fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            state: TableState::Discovered,
            detail: None,
            errors: Vec::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// The externally observable result of one provisioning invocation.
///
/// Failure accounting lives here, threaded through and returned by the run;
/// there is no process-wide counter. Each failed operation (one log-table
/// install, one view build) counts once.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tables: Vec<TableOutcome>,
    pub failure_count: u32,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            tables: Vec::new(),
            failure_count: 0,
        }
    }

    /// Record a terminal outcome for one table.
    pub fn record(&mut self, outcome: TableOutcome) {
        debug_assert!(outcome.state.is_terminal());
        self.tables.push(outcome);
    }

    /// Record one failed operation against an in-flight outcome.
    pub fn record_failure(&mut self, outcome: &mut TableOutcome, err: &AuditError) {
        outcome.state = TableState::Failed;
        outcome.errors.push(err.to_string());
        self.failure_count += 1;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn reconstructed(&self) -> usize {
        self.count_state(TableState::Reconstructed)
    }

    pub fn skipped(&self) -> usize {
        self.count_state(TableState::Skipped)
    }

    pub fn failed_tables(&self) -> usize {
        self.count_state(TableState::Failed)
    }

    fn count_state(&self, state: TableState) -> usize {
        self.tables.iter().filter(|t| t.state == state).count()
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one provisioning run end to end
pub struct Orchestrator {
    pool: Pool,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(pool: Pool, settings: Settings) -> Self {
        Self { pool, settings }
    }

    /// Run the full pipeline. Returns the per-run report; an `Err` means a
    /// run-fatal precondition or bootstrap failure, and nothing after the
    /// failing step was attempted.
    pub async fn run(&self) -> AuditResult<RunReport> {
        let policy = &self.settings.policy;
        let mut client = self.pool.get().await?;
        let mut report = RunReport::new();

        // Fatal preconditions come first, before any structural change.
        db::ensure_changed_by_setting(&client).await?;
        PolicyEvaluator::validate(policy)?;
        let evaluator = PolicyEvaluator::new(policy);

        let schemas = CatalogReader::schemas(&client).await?;
        let mut candidates: Vec<(String, String)> = Vec::new();
        for schema in &schemas {
            let tables =
                CatalogReader::tables_for_schema(&client, schema, policy.owner.as_deref()).await?;
            candidates.extend(tables.into_iter().map(|t| (schema.clone(), t)));
        }

        // Incremental re-provisioning: restrict the run to one table.
        if let Some(only) = &policy.table {
            candidates.retain(|(s, t)| format!("{s}.{t}") == *only);
            if candidates.is_empty() {
                warn!("Table override {} matched nothing in the catalog", only);
            }
        }

        info!(
            "Run {} over {} candidate tables in {} schemas",
            report.run_id,
            candidates.len(),
            schemas.len()
        );

        let json_type = CaptureInstaller::probe_json_type(&client).await?;
        let installer = CaptureInstaller::new(policy, json_type);

        if !policy.views_only {
            installer.bootstrap(&client, &schemas).await?;
        }

        for (schema, table) in &candidates {
            let outcome = self
                .provision_table(&mut client, &installer, &evaluator, &mut report, schema, table)
                .await?;
            report.record(outcome);
        }

        report.finish();
        info!(
            "Run {} complete: {} reconstructed, {} skipped, {} failed ({} failed operations)",
            report.run_id,
            report.reconstructed(),
            report.skipped(),
            report.failed_tables(),
            report.failure_count
        );
        Ok(report)
    }

    /// Take one table through the state machine. Only fatal errors propagate;
    /// everything table-scoped lands in the outcome.
    async fn provision_table(
        &self,
        client: &mut deadpool_postgres::Client,
        installer: &CaptureInstaller<'_>,
        evaluator: &PolicyEvaluator<'_>,
        report: &mut RunReport,
        schema: &str,
        table: &str,
    ) -> AuditResult<TableOutcome> {
        let policy = &self.settings.policy;
        let mut outcome = TableOutcome::new(schema, table);

        let decision = evaluator.decide(schema, table);
        if !decision.provision {
            // A previously audited table that is now excluded still needs its
            // open capture interval closed, exactly once.
            if !policy.views_only {
                if let Err(e) = CaptureInstaller::close_interval(client, schema, table).await {
                    warn!("Closing interval for excluded {}.{} failed: {}", schema, table, e);
                }
            }
            outcome.state = TableState::Skipped;
            outcome.detail = Some("excluded by policy".to_string());
            info!("Skipping {}.{}: excluded by policy", schema, table);
            return Ok(outcome);
        }
        outcome.state = TableState::Filtered;

        let pk_columns = CatalogReader::primary_key_columns(client, schema, table).await?;

        if policy.views_only {
            outcome.state = TableState::Installed;
        } else {
            match installer
                .install_table(client, schema, table, &pk_columns, decision.capture_enabled)
                .await
            {
                Ok(()) => outcome.state = TableState::Installed,
                Err(e) => {
                    error!("{}", e);
                    report.record_failure(&mut outcome, &e);
                    return Ok(outcome);
                }
            }
        }

        // Reconstruction needs a single-column primary key; anything else is
        // an explicit skip, not a failure. The raw log still captures.
        let columns = CatalogReader::columns(client, schema, table).await?;
        let descriptor = TableDescriptor::new(schema, table, columns);
        let Some(pk) = descriptor.primary_key.clone() else {
            outcome.state = TableState::Skipped;
            outcome.detail = Some("no single-column primary key; derived views skipped".to_string());
            info!(
                "Skipping views for {}.{}: no single-column primary key",
                schema, table
            );
            return Ok(outcome);
        };

        if let Err(source) = views::ensure_view_schema(client, schema).await {
            let err = AuditError::View {
                view: format!("{}_audit", schema),
                source,
            };
            error!("{}", err);
            report.record_failure(&mut outcome, &err);
            return Ok(outcome);
        }

        let mut view_failed = false;
        for kind in ViewKind::ALL {
            match views::apply_view(client, kind, &descriptor, &pk).await {
                Ok(()) => {
                    installer
                        .grant_read(
                            client,
                            &crate::install::view_audit_schema(schema),
                            &format!("{}_audit_{}", table, kind.suffix()),
                        )
                        .await;
                }
                Err(e) => {
                    // The other views for this table are still attempted.
                    error!("{}", e);
                    report.record_failure(&mut outcome, &e);
                    view_failed = true;
                }
            }
        }

        if !view_failed {
            outcome.state = TableState::Reconstructed;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn view_error(view: &str) -> AuditError {
        AuditError::View {
            view: view.to_string(),
            source: match "foo=bar".parse::<tokio_postgres::Config>() {
                Err(e) => e,
                Ok(_) => unreachable!(),
            },
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TableState::Reconstructed.is_terminal());
        assert!(TableState::Skipped.is_terminal());
        assert!(TableState::Failed.is_terminal());
        assert!(!TableState::Discovered.is_terminal());
        assert!(!TableState::Filtered.is_terminal());
        assert!(!TableState::Installed.is_terminal());
    }

    #[test]
    fn failure_count_increments_once_per_failed_operation() {
        let mut report = RunReport::new();

        // Table A: two of three views fail.
        let mut a = TableOutcome::new("app", "a");
        a.state = TableState::Installed;
        report.record_failure(&mut a, &view_error("app_audit.a_audit_delta"));
        report.record_failure(&mut a, &view_error("app_audit.a_audit_compare"));
        report.record(a);

        // Table B, processed after A, succeeds.
        let mut b = TableOutcome::new("app", "b");
        b.state = TableState::Reconstructed;
        report.record(b);

        assert_eq!(report.failure_count, 2);
        assert_eq!(report.failed_tables(), 1);
        assert_eq!(report.reconstructed(), 1);
        assert_eq!(report.tables[0].errors.len(), 2);
        assert_eq!(report.tables[0].state, TableState::Failed);
    }

    #[test]
    fn validation_skip_is_not_a_failure() {
        let mut report = RunReport::new();
        let mut outcome = TableOutcome::new("app", "memberships");
        outcome.state = TableState::Skipped;
        outcome.detail = Some("no single-column primary key; derived views skipped".to_string());
        report.record(outcome);
        report.finish();

        assert_eq!(report.failure_count, 0);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed_tables(), 0);
        assert!(report.tables[0].errors.is_empty());
    }

    #[test]
    fn report_serializes_with_outcome_detail() {
        let mut report = RunReport::new();
        let mut outcome = TableOutcome::new("scratch", "tmp");
        outcome.state = TableState::Skipped;
        outcome.detail = Some("excluded by policy".to_string());
        report.record(outcome);
        report.finish();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tables"][0]["state"], "skipped");
        assert_eq!(json["tables"][0]["detail"], "excluded by policy");
        assert_eq!(json["failure_count"], 0);
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn qualified_name_joins_schema_and_table() {
        let outcome = TableOutcome::new("app", "users");
        assert_eq!(outcome.qualified_name(), "app.users");
    }
}
