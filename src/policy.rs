//! Audit Policy Evaluator
//!
//! Applies the configured include/exclude rules to the discovered catalog and
//! produces a per-table decision: provision yes/no, capture-enabled yes/no.
//! Exclusion always wins over inclusion. The two flags are currently set
//! together; they stay separate fields because structures-present-but-paused
//! is a state the installer already supports.

use crate::config::AuditPolicy;
use crate::error::{AuditError, AuditResult};

/// Per-table outcome of policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDecision {
    pub provision: bool,
    pub capture_enabled: bool,
}

impl TableDecision {
    const EXCLUDED: TableDecision = TableDecision {
        provision: false,
        capture_enabled: false,
    };

    const AUDITED: TableDecision = TableDecision {
        provision: true,
        capture_enabled: true,
    };
}

/// Evaluates one immutable policy against qualified table names
pub struct PolicyEvaluator<'a> {
    policy: &'a AuditPolicy,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(policy: &'a AuditPolicy) -> Self {
        Self { policy }
    }

    /// Reject malformed filter configuration before any structural change.
    ///
    /// Table filters must be qualified `schema.table` names; a bare table
    /// name would silently match nothing and give a false sense of coverage.
    pub fn validate(policy: &AuditPolicy) -> AuditResult<()> {
        for entry in policy.excluded_tables.iter().chain(&policy.included_tables) {
            if entry.trim().is_empty() {
                return Err(AuditError::Policy("empty table filter entry".to_string()));
            }
            if !entry.contains('.') {
                return Err(AuditError::Policy(format!(
                    "table filter `{entry}` must be qualified as schema.table"
                )));
            }
        }
        for entry in policy.excluded_schemas.iter().chain(&policy.included_schemas) {
            if entry.trim().is_empty() {
                return Err(AuditError::Policy("empty schema filter entry".to_string()));
            }
        }
        if let Some(table) = &policy.table {
            if !table.contains('.') {
                return Err(AuditError::Policy(format!(
                    "table override `{table}` must be qualified as schema.table"
                )));
            }
        }
        Ok(())
    }

    /// Decide whether one table is provisioned and whether its capture hook
    /// is enabled.
    pub fn decide(&self, schema: &str, table: &str) -> TableDecision {
        let qualified = format!("{schema}.{table}");

        let excluded = self
            .policy
            .excluded_schemas
            .iter()
            .any(|prefix| schema.starts_with(prefix.as_str()))
            || self.policy.excluded_tables.iter().any(|t| t == &qualified);
        if excluded {
            return TableDecision::EXCLUDED;
        }

        let include_list_present =
            !self.policy.included_schemas.is_empty() || !self.policy.included_tables.is_empty();
        if include_list_present {
            let included = self.policy.included_schemas.iter().any(|s| s == schema)
                || self.policy.included_tables.iter().any(|t| t == &qualified);
            if !included {
                return TableDecision::EXCLUDED;
            }
        }

        TableDecision::AUDITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> AuditPolicy {
        AuditPolicy::default()
    }

    #[test]
    fn default_policy_audits_every_table() {
        let p = policy();
        let eval = PolicyEvaluator::new(&p);
        assert_eq!(eval.decide("app", "users"), TableDecision::AUDITED);
    }

    #[test]
    fn excludes_by_schema_prefix() {
        let mut p = policy();
        p.excluded_schemas = vec!["scratch".to_string()];
        let eval = PolicyEvaluator::new(&p);
        assert_eq!(eval.decide("scratch", "t1"), TableDecision::EXCLUDED);
        // Prefix match: a schema extending the excluded name is also out.
        assert_eq!(eval.decide("scratch_v2", "t1"), TableDecision::EXCLUDED);
        assert_eq!(eval.decide("app", "t1"), TableDecision::AUDITED);
    }

    #[test]
    fn excludes_by_qualified_table_name() {
        let mut p = policy();
        p.excluded_tables = vec!["app.sessions".to_string()];
        let eval = PolicyEvaluator::new(&p);
        assert_eq!(eval.decide("app", "sessions"), TableDecision::EXCLUDED);
        assert_eq!(eval.decide("app", "users"), TableDecision::AUDITED);
        // Same table name under another schema is unaffected.
        assert_eq!(eval.decide("billing", "sessions"), TableDecision::AUDITED);
    }

    #[test]
    fn include_list_narrows_provisioning() {
        let mut p = policy();
        p.included_schemas = vec!["app".to_string()];
        p.included_tables = vec!["billing.invoices".to_string()];
        let eval = PolicyEvaluator::new(&p);
        assert_eq!(eval.decide("app", "users"), TableDecision::AUDITED);
        assert_eq!(eval.decide("billing", "invoices"), TableDecision::AUDITED);
        assert_eq!(eval.decide("billing", "payments"), TableDecision::EXCLUDED);
    }

    #[test]
    fn exclude_wins_over_include() {
        let mut p = policy();
        p.included_schemas = vec!["app".to_string()];
        p.excluded_tables = vec!["app.sessions".to_string()];
        let eval = PolicyEvaluator::new(&p);
        assert_eq!(eval.decide("app", "sessions"), TableDecision::EXCLUDED);

        let mut p = policy();
        p.included_tables = vec!["scratch.keep_me".to_string()];
        p.excluded_schemas = vec!["scratch".to_string()];
        let eval = PolicyEvaluator::new(&p);
        // Excluded schema prefix beats an explicit include of the same table.
        assert_eq!(eval.decide("scratch", "keep_me"), TableDecision::EXCLUDED);
    }

    #[test]
    fn decision_flags_move_together() {
        let mut p = policy();
        p.excluded_schemas = vec!["scratch".to_string()];
        let eval = PolicyEvaluator::new(&p);
        for (schema, table) in [("scratch", "a"), ("app", "b")] {
            let d = eval.decide(schema, table);
            assert_eq!(d.provision, d.capture_enabled);
        }
    }

    #[test]
    fn validation_rejects_unqualified_table_filters() {
        let mut p = policy();
        p.excluded_tables = vec!["sessions".to_string()];
        assert!(matches!(
            PolicyEvaluator::validate(&p),
            Err(AuditError::Policy(_))
        ));

        let mut p = policy();
        p.table = Some("users".to_string());
        assert!(matches!(
            PolicyEvaluator::validate(&p),
            Err(AuditError::Policy(_))
        ));

        let mut p = policy();
        p.excluded_schemas = vec!["  ".to_string()];
        assert!(matches!(
            PolicyEvaluator::validate(&p),
            Err(AuditError::Policy(_))
        ));
    }

    #[test]
    fn validation_accepts_qualified_filters() {
        let mut p = policy();
        p.excluded_tables = vec!["app.sessions".to_string()];
        p.included_schemas = vec!["app".to_string()];
        p.table = Some("app.users".to_string());
        assert!(PolicyEvaluator::validate(&p).is_ok());
    }
}
