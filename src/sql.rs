//! SQL identifier and literal quoting
//!
//! All DDL in this crate is assembled from catalog-derived names, which may
//! contain arbitrary characters (quotes included). Every identifier and
//! string literal that ends up in a generated statement goes through these
//! helpers; nothing is concatenated raw.

/// Quote an SQL identifier, doubling any embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal, doubling any embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a `schema.table` pair as a qualified identifier.
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
