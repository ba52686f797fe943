//! Capture Installer
//!
//! Provisions the append-only change log and the write-time capture hook for
//! each eligible table: the per-schema raw audit schemas, the per-table log
//! table with its immutability guard, the trigger function that appends one
//! entry per DML operation, and the run-history intervals that record when
//! capture was enabled. Everything here is idempotent; re-running against an
//! already-provisioned database changes nothing.

use crate::config::{AuditPolicy, SecurityMode};
use crate::db::CHANGED_BY_SETTING;
use crate::error::{AuditError, AuditResult};
use crate::sql::{quote_ident, quote_literal, quote_qualified};
use deadpool_postgres::Client;
use tracing::{debug, info, warn};

/// A wall-clock timestamp is recorded on every Nth log entry per table. The
/// rest carry NULL; `sparse_time` is a coarse time index, not an audit-time
/// column.
pub const SPARSE_TIMESTAMP_INTERVAL: u32 = 1000;

/// Per-value truncation applied to captured row images.
pub const VALUE_TRUNCATE_CHARS: u32 = 500;

/// Captured client statement text is capped at this many characters.
pub const CLIENT_QUERY_TRUNCATE_CHARS: u32 = 1000;

/// Raw log schema for a source schema.
pub fn raw_audit_schema(schema: &str) -> String {
    format!("{schema}_audit_raw")
}

/// Derived-view schema for a source schema.
pub fn view_audit_schema(schema: &str) -> String {
    format!("{schema}_audit")
}

/// Log table name for a source table.
pub fn log_table_name(table: &str) -> String {
    format!("{table}_audit")
}

/// Sequence-id column of a log table.
pub fn entry_id_column(table: &str) -> String {
    format!("{table}_audit_id")
}

/// Which JSON encoding the target engine supports for the map-valued fields.
/// Probed once per run and applied uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Jsonb,
    Json,
}

impl JsonType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JsonType::Jsonb => "jsonb",
            JsonType::Json => "json",
        }
    }

    /// The hstore conversion function matching this encoding.
    pub fn hstore_conversion(&self) -> &'static str {
        match self {
            JsonType::Jsonb => "hstore_to_jsonb",
            JsonType::Json => "hstore_to_json",
        }
    }
}

/// Installs log structures and capture hooks per the configured policy
pub struct CaptureInstaller<'a> {
    policy: &'a AuditPolicy,
    json_type: JsonType,
}

impl<'a> CaptureInstaller<'a> {
    pub fn new(policy: &'a AuditPolicy, json_type: JsonType) -> Self {
        Self { policy, json_type }
    }

    pub fn json_type(&self) -> JsonType {
        self.json_type
    }

    /// Determine the richest JSON encoding the target supports.
    pub async fn probe_json_type(client: &Client) -> AuditResult<JsonType> {
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'jsonb') AS has_jsonb",
                &[],
            )
            .await
            .map_err(|source| AuditError::Bootstrap { step: "json type probe", source })?;

        if row.get::<_, bool>("has_jsonb") {
            debug!("Target supports jsonb");
            Ok(JsonType::Jsonb)
        } else {
            info!("Target does not support jsonb, falling back to json");
            Ok(JsonType::Json)
        }
    }

    /// Create the shared audit structures. Failures here are run-fatal; no
    /// table-specific work has started yet.
    pub async fn bootstrap(&self, client: &Client, schemas: &[String]) -> AuditResult<()> {
        client
            .batch_execute("CREATE SCHEMA IF NOT EXISTS audit")
            .await
            .map_err(|source| AuditError::Bootstrap { step: "audit schema", source })?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS audit.audit_history(
                    audit_history_id SERIAL PRIMARY KEY,
                    schema_name NAME NOT NULL,
                    table_name NAME NOT NULL,
                    start_time TIMESTAMPTZ NOT NULL,
                    end_time TIMESTAMPTZ,
                    CONSTRAINT audit_history_interval_uniq UNIQUE(schema_name, table_name, start_time)
                )
            "#,
            )
            .await
            .map_err(|source| AuditError::Bootstrap { step: "audit history table", source })?;

        client
            .batch_execute(
                r#"
                CREATE OR REPLACE FUNCTION audit.append_only_guard()
                RETURNS TRIGGER AS
                $$
                BEGIN
                    RAISE EXCEPTION 'change log is append-only: updates, deletes and truncates are rejected';
                    RETURN NULL;
                END;
                $$
                LANGUAGE plpgsql
            "#,
            )
            .await
            .map_err(|source| AuditError::Bootstrap { step: "append-only guard function", source })?;

        for schema in schemas {
            let ddl = format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&raw_audit_schema(schema))
            );
            client
                .batch_execute(&ddl)
                .await
                .map_err(|source| AuditError::Bootstrap { step: "raw audit schema", source })?;
        }

        info!("Shared audit structures ready ({} raw schemas)", schemas.len());
        Ok(())
    }

    /// Provision the log table and capture hook for one table.
    ///
    /// A failure is recorded against this table only; the orchestrator
    /// continues with the remaining tables.
    pub async fn install_table(
        &self,
        client: &mut Client,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        capture_enabled: bool,
    ) -> AuditResult<()> {
        self.install_table_inner(client, schema, table, pk_columns, capture_enabled)
            .await
            .map_err(|source| AuditError::Structural {
                table: format!("{schema}.{table}"),
                source,
            })
    }

    async fn install_table_inner(
        &self,
        client: &mut Client,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        capture_enabled: bool,
    ) -> Result<(), tokio_postgres::Error> {
        let raw_schema = raw_audit_schema(schema);
        let log_table = log_table_name(table);

        // Source tables carry an application-level actor column alongside the
        // session identity captured by the trigger.
        client
            .batch_execute(&build_add_column_sql(schema, table, "updated_by", "varchar(50)"))
            .await?;

        client
            .batch_execute(&build_log_table_sql(&raw_schema, table, self.json_type))
            .await?;

        // Guard triggers are recreated atomically so a failure never leaves
        // the log half-protected.
        {
            let tx = client.transaction().await?;
            tx.batch_execute(&build_append_only_trigger_sql(&raw_schema, &log_table))
                .await?;
            tx.commit().await?;
        }

        // Guarded adds upgrade log tables created by earlier releases.
        for (column, col_type) in [
            ("sparse_time", "timestamptz"),
            ("before_change", self.json_type.as_sql()),
            ("changed_by", "varchar(50)"),
        ] {
            client
                .batch_execute(&build_add_column_sql(&raw_schema, &log_table, column, col_type))
                .await?;
        }

        client
            .batch_execute(&build_log_index_sql(&raw_schema, table))
            .await?;

        let sequence = self.entry_sequence(client, &raw_schema, table).await?;

        let single_pk = match pk_columns {
            [only] => Some(only.as_str()),
            _ => None,
        };

        client
            .batch_execute(&build_capture_function_sql(
                schema,
                table,
                &sequence,
                self.json_type,
                self.policy.security,
                self.policy.log_client_query,
            ))
            .await?;

        {
            let tx = client.transaction().await?;
            tx.batch_execute(&build_trigger_sql(schema, table, single_pk, capture_enabled))
                .await?;
            tx.commit().await?;
        }

        if capture_enabled {
            Self::open_interval(client, schema, table).await?;
        } else {
            Self::close_interval(client, schema, table).await?;
        }

        self.grant_read(client, &raw_schema, &log_table).await;

        info!(
            "Capture installed for {}.{} (enabled: {})",
            schema, table, capture_enabled
        );
        Ok(())
    }

    /// The sequence feeding log entry ids. Reuses the log table's own serial
    /// primary-key sequence when one exists, otherwise creates a private
    /// per-table sequence.
    async fn entry_sequence(
        &self,
        client: &Client,
        raw_schema: &str,
        table: &str,
    ) -> Result<String, tokio_postgres::Error> {
        let log_table = log_table_name(table);
        let query = r#"
            SELECT DISTINCT(objid::regclass)::text AS sequence_name
            FROM pg_depend
            JOIN pg_index ON indrelid = refobjid
            JOIN pg_attribute ON attrelid = refobjid AND attnum = refobjsubid AND attnum = ANY(indkey)
            JOIN pg_class ON objid = pg_class.oid AND pg_class.relkind = 'S'
            WHERE refobjid = to_regclass($1)
              AND refobjsubid > 0
              AND indisprimary
        "#;

        let qualified = quote_qualified(raw_schema, &log_table);
        if let Some(row) = client.query_opt(query, &[&qualified]).await? {
            return Ok(row.get("sequence_name"));
        }

        let private = format!("{log_table}_entry_seq");
        client
            .batch_execute(&format!(
                "CREATE SEQUENCE IF NOT EXISTS {}",
                quote_qualified(raw_schema, &private)
            ))
            .await?;
        debug!("Using private entry sequence {}.{}", raw_schema, private);
        Ok(format!("{raw_schema}.{private}"))
    }

    /// Open a run-history interval unless one is already open. Idempotent.
    pub async fn open_interval(
        client: &Client,
        schema: &str,
        table: &str,
    ) -> Result<(), tokio_postgres::Error> {
        client
            .execute(build_open_interval_sql(), &[&schema, &table])
            .await?;
        Ok(())
    }

    /// Close the open run-history interval, if any. The `end_time IS NULL`
    /// guard makes duplicate closes a no-op.
    pub async fn close_interval(
        client: &Client,
        schema: &str,
        table: &str,
    ) -> Result<(), tokio_postgres::Error> {
        let closed = client
            .execute(build_close_interval_sql(), &[&schema, &table])
            .await?;
        if closed > 0 {
            info!("Closed capture interval for {}.{}", schema, table);
        }
        Ok(())
    }

    /// Grant read access to the configured grantee. Best-effort: a missing
    /// role or insufficient privilege is logged, never aborts the run.
    pub async fn grant_read(&self, client: &Client, schema: &str, object: &str) {
        let Some(grantee) = &self.policy.grantee else {
            return;
        };
        let grants = format!(
            "GRANT USAGE ON SCHEMA {} TO {}; GRANT SELECT ON {} TO {};",
            quote_ident(schema),
            quote_ident(grantee),
            quote_qualified(schema, object),
            quote_ident(grantee),
        );
        if let Err(e) = client.batch_execute(&grants).await {
            warn!("Grant to {} on {}.{} failed: {}", grantee, schema, object, e);
        }
    }
}

/// Open a capture interval for `($1, $2)`. The NOT EXISTS guard on an open
/// interval (`end_time IS NULL`) makes re-opening a no-op.
pub fn build_open_interval_sql() -> &'static str {
    r#"
        INSERT INTO audit.audit_history(schema_name, table_name, start_time)
        SELECT $1::name, $2::name, now()
        WHERE NOT EXISTS (
            SELECT 1 FROM audit.audit_history
            WHERE schema_name = $1::name AND table_name = $2::name AND end_time IS NULL
        )
    "#
}

/// Close the open capture interval for `($1, $2)`. Restricted to rows where
/// `end_time IS NULL`, so closed intervals are never touched again.
pub fn build_close_interval_sql() -> &'static str {
    r#"
        UPDATE audit.audit_history SET end_time = now()
        WHERE schema_name = $1::name AND table_name = $2::name AND end_time IS NULL
    "#
}

/// Guarded column add, safe to re-run: an already-existing column raises a
/// notice instead of an error.
pub fn build_add_column_sql(schema: &str, table: &str, column: &str, col_type: &str) -> String {
    format!(
        r#"DO
$$
BEGIN
    BEGIN
        ALTER TABLE {target} ADD COLUMN {column} {col_type};
    EXCEPTION
        WHEN duplicate_column THEN RAISE NOTICE 'column {column_note} already exists in {target_note}';
    END;
END;
$$"#,
        target = quote_qualified(schema, table),
        column = quote_ident(column),
        col_type = col_type,
        column_note = column.replace('\'', ""),
        target_note = format!("{schema}.{table}").replace('\'', ""),
    )
}

/// The per-table log table. Sparse wire format: a sequence id, the operation
/// tag, actor and origin info, and the two map-valued change fields.
pub fn build_log_table_sql(raw_schema: &str, table: &str, json_type: JsonType) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {log_table}(
    {id_col} BIGSERIAL PRIMARY KEY,
    changed_at TIMESTAMPTZ NOT NULL,
    db_user VARCHAR(50) NOT NULL,
    client_addr INET,
    client_port INTEGER,
    client_query TEXT,
    operation VARCHAR(1) NOT NULL,
    before_change {json},
    change {json},
    primary_key TEXT
)"#,
        log_table = quote_qualified(raw_schema, &log_table_name(table)),
        id_col = quote_ident(&entry_id_column(table)),
        json = json_type.as_sql(),
    )
}

/// Immutability guard: in-place update, delete, and truncate against the log
/// all raise.
pub fn build_append_only_trigger_sql(raw_schema: &str, log_table: &str) -> String {
    let target = quote_qualified(raw_schema, log_table);
    format!(
        r#"DROP TRIGGER IF EXISTS append_only_guard ON {target};
CREATE TRIGGER append_only_guard
BEFORE UPDATE OR DELETE ON {target}
FOR EACH ROW
EXECUTE PROCEDURE audit.append_only_guard();

DROP TRIGGER IF EXISTS append_only_guard_truncate ON {target};
CREATE TRIGGER append_only_guard_truncate
BEFORE TRUNCATE ON {target}
FOR EACH STATEMENT
EXECUTE PROCEDURE audit.append_only_guard();"#
    )
}

/// Index the log on primary key (reconstruction joins) and sparse time
/// (coarse time lookups). Guarded so re-runs are no-ops.
pub fn build_log_index_sql(raw_schema: &str, table: &str) -> String {
    let pk_index = format!("index_{table}_on_primary_key");
    let time_index = format!("index_{table}_on_sparse_time");
    format!(
        r#"DO
$$
BEGIN
    IF NOT EXISTS (
            SELECT 1
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = {pk_index_lit}
            AND n.nspname = {schema_lit}
    ) THEN
        CREATE INDEX {pk_index} ON {log_table}(primary_key);
        CREATE INDEX {time_index} ON {log_table}(sparse_time) WHERE sparse_time IS NOT NULL;
    END IF;
END;
$$"#,
        pk_index_lit = quote_literal(&pk_index),
        schema_lit = quote_literal(raw_schema),
        pk_index = quote_ident(&pk_index),
        time_index = quote_ident(&time_index),
        log_table = quote_qualified(raw_schema, &log_table_name(table)),
    )
}

/// The write-time capture function for one table.
///
/// Appends one log entry per DML operation: Update stores the old values of
/// exactly the changed columns in `before_change` and their new values in
/// `change`; Insert stores only the primary-key value; Delete stores the full
/// old row in `before_change`; Truncate stores neither. Captured values are
/// truncated to 500 characters. Every 1000th entry carries a wall-clock
/// timestamp. The primary-key column name arrives as the trigger argument;
/// without one (compound or missing key) `primary_key` is NULL.
pub fn build_capture_function_sql(
    schema: &str,
    table: &str,
    sequence: &str,
    json_type: JsonType,
    security: SecurityMode,
    log_client_query: bool,
) -> String {
    let raw_schema = raw_audit_schema(schema);
    let log_target = quote_qualified(&raw_schema, &log_table_name(table));
    let id_col = quote_ident(&entry_id_column(table));
    let convert = json_type.hstore_conversion();
    let client_query = if log_client_query {
        format!("substring(current_query(), 1, {CLIENT_QUERY_TRUNCATE_CHARS})")
    } else {
        "NULL".to_string()
    };

    let insert = |before: &str, change: &str, primary_key: &str| {
        format!(
            "INSERT INTO {log_target}({id_col}, changed_at, changed_by, sparse_time, db_user, client_addr, client_port, client_query, operation, before_change, change, primary_key)\n\
             \t\tVALUES(entry_id, now(), current_setting('{CHANGED_BY_SETTING}'), entry_sparse_time, session_user::TEXT, inet_client_addr(), inet_client_port(), {client_query}, substring(TG_OP,1,1), {before}, {change}, {primary_key});"
        )
    };

    format!(
        r#"CREATE OR REPLACE FUNCTION {fn_name}()
RETURNS TRIGGER AS
$$
DECLARE
    value_row HSTORE = hstore(NULL);
    new_row HSTORE = hstore(NULL);
    entry_sparse_time TIMESTAMPTZ = NULL;
    entry_id BIGINT;
BEGIN
    SELECT nextval({seq_lit}) INTO entry_id;
    IF (entry_id % {sparse_interval} = 0) THEN
        entry_sparse_time = now();
    END IF;
    IF (TG_OP = 'UPDATE') THEN
        new_row = hstore(NEW);
        SELECT hstore(array_agg(sq.key), array_agg(sq.value)) INTO value_row
        FROM (SELECT (each(h.h)).key AS key, substring((each(h.h)).value FROM 1 FOR {truncate}) AS value
              FROM (SELECT hstore(OLD) - hstore(NEW) AS h) h) sq;
        IF new_row ? TG_ARGV[0] THEN
        {update_with_pk}
        ELSE
        {update_no_pk}
        END IF;
    ELSIF (TG_OP = 'INSERT') THEN
        value_row = hstore(NEW);
        IF value_row ? TG_ARGV[0] THEN
        {insert_with_pk}
        ELSE
        {insert_no_pk}
        END IF;
    ELSIF (TG_OP = 'DELETE') THEN
        SELECT hstore(array_agg(sq.key), array_agg(sq.value)) INTO value_row
        FROM (SELECT (each(h)).key AS key, substring((each(h)).value FROM 1 FOR {truncate}) AS value
              FROM hstore(OLD) h) sq;
        IF value_row ? TG_ARGV[0] THEN
        {delete_with_pk}
        ELSE
        {delete_no_pk}
        END IF;
    ELSIF (TG_OP = 'TRUNCATE') THEN
        {truncate_entry}
    ELSE
        RETURN NULL;
    END IF;

    RETURN NULL;
END;
$$
LANGUAGE plpgsql
SECURITY {security}"#,
        fn_name = quote_qualified(&raw_schema, &capture_function_name(schema, table)),
        seq_lit = quote_literal(sequence),
        sparse_interval = SPARSE_TIMESTAMP_INTERVAL,
        truncate = VALUE_TRUNCATE_CHARS,
        update_with_pk = insert(
            &format!("{convert}(value_row)"),
            &format!("{convert}(hstore(NEW) - hstore(OLD))"),
            "new_row -> TG_ARGV[0]",
        ),
        update_no_pk = insert(
            &format!("{convert}(value_row)"),
            &format!("{convert}(hstore(NEW) - hstore(OLD))"),
            "NULL",
        ),
        insert_with_pk = insert("NULL", "NULL", "value_row -> TG_ARGV[0]"),
        insert_no_pk = insert("NULL", "NULL", "NULL"),
        delete_with_pk = insert(&format!("{convert}(value_row)"), "NULL", "value_row -> TG_ARGV[0]"),
        delete_no_pk = insert(&format!("{convert}(value_row)"), "NULL", "NULL"),
        truncate_entry = insert("NULL", "NULL", "NULL"),
        security = security.as_sql(),
    )
}

/// Name of the capture function for one table.
pub fn capture_function_name(schema: &str, table: &str) -> String {
    format!("capture_{schema}_{table}")
}

/// Drop and recreate the capture triggers; disable them when capture is off.
///
/// Toggling is enable/disable of the hook only; the log and its history are
/// never dropped. The single primary-key column name rides along as the
/// trigger argument when the table has one.
pub fn build_trigger_sql(
    schema: &str,
    table: &str,
    single_pk: Option<&str>,
    capture_enabled: bool,
) -> String {
    let target = quote_qualified(schema, table);
    let function = quote_qualified(
        &raw_audit_schema(schema),
        &capture_function_name(schema, table),
    );
    let pk_arg = single_pk.map(quote_literal).unwrap_or_default();

    let mut ddl = format!(
        r#"DROP TRIGGER IF EXISTS row_change_audit ON {target};
DROP TRIGGER IF EXISTS statement_change_audit ON {target};
CREATE TRIGGER row_change_audit
AFTER INSERT OR UPDATE OR DELETE ON {target}
FOR EACH ROW
EXECUTE PROCEDURE {function}({pk_arg});
CREATE TRIGGER statement_change_audit
AFTER TRUNCATE ON {target}
FOR EACH STATEMENT
EXECUTE PROCEDURE {function}({pk_arg});"#
    );

    if !capture_enabled {
        ddl.push_str(&format!(
            "\nALTER TABLE {target} DISABLE TRIGGER row_change_audit;\n\
             ALTER TABLE {target} DISABLE TRIGGER statement_change_audit;"
        ));
    }

    ddl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_table_ddl_is_guarded_and_sparse() {
        let ddl = build_log_table_sql("app_audit_raw", "users", JsonType::Jsonb);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(ddl.contains("\"users_audit_id\" BIGSERIAL PRIMARY KEY"));
        assert!(ddl.contains("before_change jsonb"));
        assert!(ddl.contains("change jsonb"));
        assert!(ddl.contains("primary_key TEXT"));
        // The sparse timestamp column arrives via a guarded add, not here.
        assert!(!ddl.contains("sparse_time"));
    }

    #[test]
    fn append_only_guard_covers_all_mutations() {
        let ddl = build_append_only_trigger_sql("app_audit_raw", "users_audit");
        assert!(ddl.contains("BEFORE UPDATE OR DELETE ON \"app_audit_raw\".\"users_audit\""));
        assert!(ddl.contains("BEFORE TRUNCATE ON \"app_audit_raw\".\"users_audit\""));
        assert!(ddl.matches("audit.append_only_guard()").count() == 2);
    }

    #[test]
    fn add_column_tolerates_existing_column() {
        let ddl = build_add_column_sql("app", "users", "updated_by", "varchar(50)");
        assert!(ddl.contains("ALTER TABLE \"app\".\"users\" ADD COLUMN \"updated_by\" varchar(50)"));
        assert!(ddl.contains("WHEN duplicate_column THEN RAISE NOTICE"));
    }

    #[test]
    fn index_ddl_is_guarded_and_partial_on_sparse_time() {
        let ddl = build_log_index_sql("app_audit_raw", "users");
        assert!(ddl.contains("IF NOT EXISTS"));
        assert!(ddl.contains("'index_users_on_primary_key'"));
        assert!(ddl.contains("(sparse_time) WHERE sparse_time IS NOT NULL"));
    }

    #[test]
    fn capture_function_stamps_every_thousandth_entry() {
        let ddl = build_capture_function_sql(
            "app",
            "users",
            "app_audit_raw.users_audit_users_audit_id_seq",
            JsonType::Jsonb,
            SecurityMode::Definer,
            false,
        );
        assert!(ddl.contains("IF (entry_id % 1000 = 0)"));
        assert!(ddl.contains("entry_sparse_time = now()"));
    }

    #[test]
    fn capture_function_reads_changed_by_setting() {
        let ddl = build_capture_function_sql(
            "app",
            "users",
            "seq",
            JsonType::Jsonb,
            SecurityMode::Definer,
            false,
        );
        assert!(ddl.contains("current_setting('rowtrail.changed_by')"));
        assert!(ddl.contains("session_user::TEXT"));
    }

    #[test]
    fn capture_function_respects_security_mode() {
        let definer = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Definer, false,
        );
        let invoker = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Invoker, false,
        );
        assert!(definer.ends_with("SECURITY DEFINER"));
        assert!(invoker.ends_with("SECURITY INVOKER"));
    }

    #[test]
    fn capture_function_client_query_toggle() {
        let on = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Definer, true,
        );
        let off = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Definer, false,
        );
        assert!(on.contains("substring(current_query(), 1, 1000)"));
        assert!(!off.contains("current_query()"));
    }

    #[test]
    fn capture_function_encoding_follows_probe() {
        let jsonb = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Definer, false,
        );
        let json = build_capture_function_sql(
            "app", "users", "seq", JsonType::Json, SecurityMode::Definer, false,
        );
        assert!(jsonb.contains("hstore_to_jsonb(value_row)"));
        assert!(!jsonb.contains("hstore_to_json(value_row)"));
        assert!(json.contains("hstore_to_json(value_row)"));
    }

    #[test]
    fn capture_function_truncates_captured_values() {
        let ddl = build_capture_function_sql(
            "app", "users", "seq", JsonType::Jsonb, SecurityMode::Definer, false,
        );
        assert!(ddl.contains("FROM 1 FOR 500"));
    }

    #[test]
    fn triggers_carry_pk_argument_when_single_key() {
        let ddl = build_trigger_sql("app", "users", Some("id"), true);
        assert!(ddl.contains("EXECUTE PROCEDURE \"app_audit_raw\".\"capture_app_users\"('id')"));
        assert!(!ddl.contains("DISABLE TRIGGER"));
    }

    #[test]
    fn triggers_without_single_key_take_no_argument() {
        let ddl = build_trigger_sql("app", "memberships", None, true);
        assert!(ddl.contains("\"capture_app_memberships\"()"));
    }

    #[test]
    fn opening_an_interval_skips_when_one_is_already_open() {
        let sql = build_open_interval_sql();
        assert!(sql.contains("INSERT INTO audit.audit_history"));
        // The insert only fires when no open interval exists for the table.
        assert!(sql.contains("WHERE NOT EXISTS"));
        assert!(sql.contains("AND end_time IS NULL"));
    }

    #[test]
    fn closing_an_interval_touches_only_the_open_one() {
        let sql = build_close_interval_sql();
        assert!(sql.contains("UPDATE audit.audit_history SET end_time = now()"));
        assert!(sql.trim_end().ends_with("AND end_time IS NULL"));
    }

    #[test]
    fn disabled_capture_keeps_triggers_but_disables_them() {
        let ddl = build_trigger_sql("app", "users", Some("id"), false);
        assert!(ddl.contains("CREATE TRIGGER row_change_audit"));
        assert!(ddl.contains("DISABLE TRIGGER row_change_audit"));
        assert!(ddl.contains("DISABLE TRIGGER statement_change_audit"));
    }
}
