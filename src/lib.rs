//! rowtrail - row-level change auditing provisioner for PostgreSQL
//!
//! Provisions and maintains a change-audit capability on top of a live
//! database: for each eligible table it installs an append-only sparse
//! change log, a write-time capture trigger, and three derived views
//! (delta, snapshot, compare) that reconstruct historical row state from
//! the log at query time.
//!
//! Pipeline: the catalog reader enumerates schemas, tables, and typed
//! columns; the policy evaluator decides per table whether to provision and
//! whether capture is enabled; the capture installer puts the log and hook
//! in place; the view builder derives the reconstructions; the orchestrator
//! sequences all of it with continue-on-error semantics and returns a
//! per-run report.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod install;
pub mod orchestrator;
pub mod policy;
pub mod sql;
pub mod views;
