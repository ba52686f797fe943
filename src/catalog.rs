//! Schema Catalog Reader
//!
//! Enumerates schemas, base tables, and typed column metadata from the live
//! database. Descriptors are discovered fresh on every run and never
//! persisted, so provisioning automatically tracks columns added or removed
//! since the last run. Any catalog query failure is a `DiscoveryError` and
//! aborts the run.

use crate::error::{AuditError, AuditResult};
use crate::sql::quote_ident;
use serde::Serialize;
use tokio_postgres::Client;
use tracing::debug;

/// One column of a candidate table, valid for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Formatted scalar type, e.g. `character varying(50)`.
    pub data_type: String,
    pub is_primary_key: bool,
}

/// One candidate table with its current column set.
///
/// `primary_key` is present only when exactly one primary-key column exists;
/// tables with zero or compound keys are permanently ineligible for derived
/// views, though capture still occurs for them.
#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Option<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn new(schema: &str, name: &str, columns: Vec<ColumnDescriptor>) -> Self {
        let mut pk_columns = columns.iter().filter(|c| c.is_primary_key);
        let primary_key = match (pk_columns.next(), pk_columns.next()) {
            (Some(pk), None) => Some(pk.clone()),
            _ => None,
        };
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            columns,
            primary_key,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Catalog introspection for the target database
pub struct CatalogReader;

impl CatalogReader {
    /// All candidate schemas: non-system, non-audit-infrastructure.
    pub async fn schemas(client: &Client) -> AuditResult<Vec<String>> {
        let query = r#"
            SELECT schema_name
            FROM information_schema.schemata
            WHERE schema_name NOT LIKE '%audit%'
              AND schema_name NOT LIKE 'pg\_%'
              AND schema_name NOT IN ('public', 'information_schema')
            ORDER BY schema_name
        "#;

        let rows = client
            .query(query, &[])
            .await
            .map_err(AuditError::Discovery)?;

        let schemas: Vec<String> = rows.iter().map(|r| r.get("schema_name")).collect();
        debug!("Discovered {} candidate schemas", schemas.len());
        Ok(schemas)
    }

    /// Base tables of one schema, optionally restricted to a configured owner.
    pub async fn tables_for_schema(
        client: &Client,
        schema: &str,
        owner: Option<&str>,
    ) -> AuditResult<Vec<String>> {
        let mut query = String::from(
            r#"
            SELECT c.relname AS table_name
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_roles r ON r.oid = c.relowner
            WHERE n.nspname = $1
              AND c.relkind = 'r'
              AND NOT c.relisshared
        "#,
        );
        if owner.is_some() {
            query.push_str(" AND r.rolname = $2");
        }
        query.push_str(" ORDER BY c.relname");

        let rows = match owner {
            Some(role) => client.query(&query, &[&schema, &role]).await,
            None => client.query(&query, &[&schema]).await,
        }
        .map_err(AuditError::Discovery)?;

        Ok(rows.iter().map(|r| r.get("table_name")).collect())
    }

    /// Typed column descriptors for one table, read from `pg_attribute` so
    /// dropped columns are excluded and types come back fully formatted.
    pub async fn columns(
        client: &Client,
        schema: &str,
        table: &str,
    ) -> AuditResult<Vec<ColumnDescriptor>> {
        let query = r#"
            SELECT DISTINCT ON (attname)
                   attname AS column_name,
                   format_type(atttypid, atttypmod) AS data_type,
                   COALESCE(indisprimary, FALSE) AS is_primary_key
            FROM pg_attribute
            LEFT JOIN pg_index ON pg_index.indrelid = pg_attribute.attrelid
                              AND pg_attribute.attnum = ANY(pg_index.indkey)
            WHERE pg_attribute.attnum > 0
              AND NOT pg_attribute.attisdropped
              AND pg_attribute.attrelid = to_regclass($1)
            ORDER BY attname, indisprimary DESC NULLS LAST, attnum
        "#;

        let regclass = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let rows = client
            .query(query, &[&regclass])
            .await
            .map_err(AuditError::Discovery)?;

        Ok(rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                is_primary_key: row.get("is_primary_key"),
            })
            .collect())
    }

    /// Names of the primary-key member columns of one table.
    pub async fn primary_key_columns(
        client: &Client,
        schema: &str,
        table: &str,
    ) -> AuditResult<Vec<String>> {
        let query = r#"
            SELECT a.attname AS column_name
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            JOIN pg_class c ON i.indrelid = c.oid
            JOIN pg_namespace n ON c.relnamespace = n.oid
            WHERE i.indisprimary
              AND n.nspname = $1
              AND c.relname = $2
            ORDER BY a.attnum
        "#;

        let rows = client
            .query(query, &[&schema, &table])
            .await
            .map_err(AuditError::Discovery)?;

        Ok(rows.iter().map(|r| r.get("column_name")).collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str, pk: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: "text".to_string(),
            is_primary_key: pk,
        }
    }

    #[test]
    fn single_pk_column_is_detected() {
        let table = TableDescriptor::new("app", "users", vec![col("id", true), col("email", false)]);
        assert_eq!(table.primary_key.as_ref().map(|c| c.name.as_str()), Some("id"));
        assert_eq!(table.qualified_name(), "app.users");
    }

    #[test]
    fn compound_pk_yields_no_primary_key() {
        let table = TableDescriptor::new(
            "app",
            "memberships",
            vec![col("user_id", true), col("group_id", true), col("role", false)],
        );
        assert!(table.primary_key.is_none());
    }

    #[test]
    fn missing_pk_yields_no_primary_key() {
        let table = TableDescriptor::new("app", "events", vec![col("payload", false)]);
        assert!(table.primary_key.is_none());
    }
}
