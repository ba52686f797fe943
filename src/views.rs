//! Reconstruction View Builder
//!
//! Builds the three derived views (delta, snapshot, compare) that recover
//! historical row state from the sparse change log. The log deliberately
//! stores no full before/after row on every operation, so reconstruction of
//! "what did column X look like at entry N" joins forward to the next entry
//! whose `before_change` mentions the column, and falls back to the live row
//! when no later entry does.
//!
//! The shared primitive, per (entry, column):
//! - `stored_before`: `before_change ->> col`, when present
//! - `stored_new`: `change ->> col`, when present
//! - `next_before`: among entries for the same primary key with a strictly
//!   greater sequence id, the smallest id whose `before_change` contains the
//!   column (ids are unique per table, so ties are impossible)
//! - `live`: the column's current value in the source table, NULL once the
//!   row is gone
//!
//! Known limitation: when a primary-key value is deleted and later reused by
//! an unrelated row, the forward lookup and the live fallback can attribute
//! the newer row's values to the older row's history.
//!
//! Views are built only for tables with a single-column primary key and are
//! reassembled from the current column set on every run, so added or removed
//! columns need no manual migration.

use crate::catalog::{ColumnDescriptor, TableDescriptor};
use crate::error::{AuditError, AuditResult};
use crate::install::{entry_id_column, log_table_name, raw_audit_schema, view_audit_schema};
use crate::sql::{quote_ident, quote_literal, quote_qualified};
use deadpool_postgres::Client;
use tracing::info;

/// The three derived reconstructions over one table's change log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Per-entry old/new pairs for exactly what changed.
    Delta,
    /// Full row state immediately after each entry.
    Snapshot,
    /// Per-entry old/new pairs with full-row reconstruction on both sides.
    Compare,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Delta, ViewKind::Snapshot, ViewKind::Compare];

    pub fn suffix(&self) -> &'static str {
        match self {
            ViewKind::Delta => "delta",
            ViewKind::Snapshot => "snapshot",
            ViewKind::Compare => "compare",
        }
    }

    /// Qualified name of this view for one table.
    pub fn qualified_name(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}_audit_{}",
            view_audit_schema(schema),
            table,
            self.suffix()
        )
    }
}

/// Create the per-schema view schema if absent.
pub async fn ensure_view_schema(client: &Client, schema: &str) -> Result<(), tokio_postgres::Error> {
    let ddl = format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(&view_audit_schema(schema))
    );
    client.batch_execute(&ddl).await
}

/// Drop and recreate one derived view inside a single transaction.
///
/// A failure rolls back atomically, is reported as a `ViewError`, and leaves
/// the table's other views untouched.
pub async fn apply_view(
    client: &mut Client,
    kind: ViewKind,
    table: &TableDescriptor,
    pk: &ColumnDescriptor,
) -> AuditResult<()> {
    let sql = build_view_sql(kind, table, pk);
    let apply = async {
        let tx = client.transaction().await?;
        tx.batch_execute(&sql).await?;
        tx.commit().await
    };
    apply.await.map_err(|source| AuditError::View {
        view: kind.qualified_name(&table.schema, &table.name),
        source,
    })?;

    info!("Created view {}", kind.qualified_name(&table.schema, &table.name));
    Ok(())
}

/// Assemble the DDL for one view kind from the table's typed column set.
pub fn build_view_sql(kind: ViewKind, table: &TableDescriptor, pk: &ColumnDescriptor) -> String {
    let ctx = ViewContext::new(table, pk);
    let mut sql = ctx.header(kind);

    let mut projections = Vec::new();
    for column in &table.columns {
        match kind {
            ViewKind::Delta => {
                projections.push(ctx.delta_old(column));
                projections.push(ctx.delta_new(column));
            }
            ViewKind::Snapshot => projections.push(ctx.snapshot_state(column)),
            ViewKind::Compare => {
                projections.push(ctx.compare_old(column));
                projections.push(ctx.compare_new(column));
            }
        }
    }
    sql.push_str(&projections.join(",\n    "));

    sql.push_str(&ctx.from_clause());
    if matches!(kind, ViewKind::Snapshot | ViewKind::Compare) {
        for column in &table.columns {
            sql.push_str(&ctx.next_before_join(column));
        }
    }
    sql.push(';');
    sql
}

/// Shared naming and expression helpers for one table's view DDL
struct ViewContext<'a> {
    table: &'a TableDescriptor,
    pk: &'a ColumnDescriptor,
    raw_schema: String,
    log_table: String,
    id_col: String,
}

impl<'a> ViewContext<'a> {
    fn new(table: &'a TableDescriptor, pk: &'a ColumnDescriptor) -> Self {
        Self {
            table,
            pk,
            raw_schema: raw_audit_schema(&table.schema),
            log_table: log_table_name(&table.name),
            id_col: entry_id_column(&table.name),
        }
    }

    /// The log table identifier as referenced inside the view body.
    fn log_ref(&self) -> String {
        quote_ident(&self.log_table)
    }

    fn header(&self, kind: ViewKind) -> String {
        let view = quote_qualified(
            &view_audit_schema(&self.table.schema),
            &format!("{}_audit_{}", self.table.name, kind.suffix()),
        );
        format!(
            "DROP VIEW IF EXISTS {view};\n\
             CREATE VIEW {view} AS\n\
             SELECT {id},\n    \
             {log}.primary_key AS primary_key,\n    \
             {log}.changed_at AS audited_changed_at,\n    \
             {log}.sparse_time AS audited_sparse_time,\n    \
             {log}.operation AS audited_operation,\n    \
             {log}.db_user AS audited_db_user,\n    \
             {log}.changed_by AS audited_change_agent,\n    ",
            view = view,
            id = quote_ident(&self.id_col),
            log = self.log_ref(),
        )
    }

    /// `stored_before(entry, col)` as SQL.
    fn stored_before(&self, column: &ColumnDescriptor) -> String {
        format!(
            "(before_change ->> {})::{}",
            quote_literal(&column.name),
            column.data_type
        )
    }

    /// `stored_new(entry, col)` as SQL.
    fn stored_new(&self, column: &ColumnDescriptor) -> String {
        format!(
            "(change ->> {})::{}",
            quote_literal(&column.name),
            column.data_type
        )
    }

    /// `live(col)` as SQL: the current source-row value via the primary-key
    /// join, NULL when the row no longer exists.
    fn live(&self, column: &ColumnDescriptor) -> String {
        format!(
            "({} ->> {})::{}",
            quote_ident(&format!("{}_json", self.table.name)),
            quote_literal(&column.name),
            column.data_type
        )
    }

    /// `next_before(entry, col)` as an inline correlated subquery (delta).
    fn next_before_subquery(&self, column: &ColumnDescriptor) -> String {
        let log = self.log_ref();
        let id = quote_ident(&self.id_col);
        format!(
            "(\n        SELECT (fwd.before_change ->> {col})::{ty}\n        \
             FROM {raw}.{log_table} fwd\n        \
             WHERE fwd.primary_key = {log}.primary_key\n        \
             AND fwd.{id} > {log}.{id}\n        \
             AND (fwd.before_change -> {col}) IS NOT NULL\n        \
             ORDER BY fwd.{id}\n        \
             LIMIT 1\n    )",
            col = quote_literal(&column.name),
            ty = column.data_type,
            raw = quote_ident(&self.raw_schema),
            log_table = quote_ident(&self.log_table),
            log = log,
            id = id,
        )
    }

    /// `next_before(entry, col)` as a lateral join (snapshot, compare), one
    /// per column, aliased `"<col>_nb"`.
    fn next_before_join(&self, column: &ColumnDescriptor) -> String {
        let log = self.log_ref();
        let id = quote_ident(&self.id_col);
        format!(
            "\nLEFT JOIN LATERAL (\n    \
             SELECT (fwd.before_change ->> {col})::{ty} AS value\n    \
             FROM {raw}.{log_table} fwd\n    \
             WHERE fwd.primary_key = {log}.primary_key\n    \
             AND fwd.{id} > {log}.{id}\n    \
             AND (fwd.before_change -> {col}) IS NOT NULL\n    \
             ORDER BY fwd.{id}\n    \
             LIMIT 1\n) {alias} ON TRUE",
            col = quote_literal(&column.name),
            ty = column.data_type,
            raw = quote_ident(&self.raw_schema),
            log_table = quote_ident(&self.log_table),
            log = log,
            id = id,
            alias = self.nb_alias(column),
        )
    }

    fn nb_alias(&self, column: &ColumnDescriptor) -> String {
        quote_ident(&format!("{}_nb", column.name))
    }

    fn nb_value(&self, column: &ColumnDescriptor) -> String {
        format!("{}.value", self.nb_alias(column))
    }

    /// Delta `old_X`: the stored before-image, nothing else. NULL for
    /// Insert/Truncate entries, whose `before_change` is empty.
    fn delta_old(&self, column: &ColumnDescriptor) -> String {
        format!(
            "{} AS {}",
            self.stored_before(column),
            quote_ident(&format!("old_{}", column.name))
        )
    }

    /// Delta `new_X`: the stored new value; for Insert entries, which store
    /// no row image, the forward lookup and then the live row.
    fn delta_new(&self, column: &ColumnDescriptor) -> String {
        format!(
            "CASE WHEN {log}.operation = 'I' THEN COALESCE({nb}, {live})\n    \
             ELSE {stored_new} END AS {alias}",
            log = self.log_ref(),
            nb = self.next_before_subquery(column),
            live = self.live(column),
            stored_new = self.stored_new(column),
            alias = quote_ident(&format!("new_{}", column.name)),
        )
    }

    /// Snapshot `X`: row state immediately after the entry. Undefined after
    /// Delete/Truncate (the row does not exist); otherwise the stored new
    /// value, then the forward lookup, then the live row.
    fn snapshot_state(&self, column: &ColumnDescriptor) -> String {
        format!(
            "CASE WHEN {log}.operation IN ('D', 'T') THEN NULL\n    \
             ELSE COALESCE({stored_new}, {nb}, {live}) END AS {alias}",
            log = self.log_ref(),
            stored_new = self.stored_new(column),
            nb = self.nb_value(column),
            live = self.live(column),
            alias = quote_ident(&column.name),
        )
    }

    /// Compare `old_X`: the stored before-image; otherwise reconstructed
    /// forward, except for Insert entries, which have no before-state.
    fn compare_old(&self, column: &ColumnDescriptor) -> String {
        format!(
            "COALESCE({stored_before},\n    \
             CASE WHEN {log}.operation = 'I' THEN NULL\n    \
             ELSE COALESCE({nb}, {live}) END) AS {alias}",
            stored_before = self.stored_before(column),
            log = self.log_ref(),
            nb = self.nb_value(column),
            live = self.live(column),
            alias = quote_ident(&format!("old_{}", column.name)),
        )
    }

    /// Compare `new_X`: the stored new value; otherwise reconstructed
    /// forward, except after Delete/Truncate, which leave no row.
    fn compare_new(&self, column: &ColumnDescriptor) -> String {
        format!(
            "CASE WHEN {log}.operation IN ('D', 'T') THEN NULL\n    \
             ELSE COALESCE({stored_new}, {nb}, {live}) END AS {alias}",
            log = self.log_ref(),
            stored_new = self.stored_new(column),
            nb = self.nb_value(column),
            live = self.live(column),
            alias = quote_ident(&format!("new_{}", column.name)),
        )
    }

    /// Log scan plus the live-row join keyed on the single primary key.
    fn from_clause(&self) -> String {
        let log = self.log_ref();
        format!(
            "\nFROM {raw}.{log_table}\n\
             LEFT JOIN {source} ON {log}.primary_key::{pk_ty} = {source}.{pk_col}\n\
             LEFT JOIN LATERAL row_to_json({src_name}.*) {json_alias} ON TRUE",
            raw = quote_ident(&self.raw_schema),
            log_table = quote_ident(&self.log_table),
            source = quote_qualified(&self.table.schema, &self.table.name),
            log = log,
            pk_ty = self.pk.data_type,
            pk_col = quote_ident(&self.pk.name),
            src_name = quote_ident(&self.table.name),
            json_alias = quote_ident(&format!("{}_json", self.table.name)),
        )
    }
}
