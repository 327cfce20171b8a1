//! Interceptor gateway: user hooks around applier execution.
//!
//! Replication behaviour can be customised without rebuilding the engine:
//! the applier calls [`ChangesetInterceptor::before_apply`] before opening
//! its transaction (returning `true` skips the changeset, which is then
//! acked without applying) and [`ChangesetInterceptor::after_apply`] with
//! the applier's result, whose return value replaces it.
//!
//! The [`RuleInterceptor`] is the declarative implementation behind the
//! `--interceptor` flag; library embedders can install any trait impl.

use std::path::Path;

use serde::Deserialize;

use quill_cdc::Changeset;

use crate::ReplicationError;

/// Optional hooks invoked around the replay of each incoming changeset.
pub trait ChangesetInterceptor: Send + Sync {
    /// Runs before the applier opens its transaction.
    ///
    /// Returning `Ok(true)` skips the changeset: the delivery is acked
    /// without any local SQL executing. An error withholds the ack.
    fn before_apply(&self, _changeset: &Changeset) -> Result<bool, ReplicationError> {
        Ok(false)
    }

    /// Runs after the applier finishes; the returned value replaces the
    /// applier's result (so a hook can swallow expected failures).
    fn after_apply(
        &self,
        _changeset: &Changeset,
        outcome: Result<(), ReplicationError>,
    ) -> Result<(), ReplicationError> {
        outcome
    }
}

/// Declarative interceptor rules loaded from a TOML file.
///
/// ```toml
/// skip-nodes = ["reporting-1"]
/// ignore-error-command-prefixes = ["ALTER TABLE"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InterceptorRules {
    /// Changesets originating from these nodes are skipped entirely.
    #[serde(default)]
    pub skip_nodes: Vec<String>,

    /// Apply errors are swallowed when any change in the failing changeset
    /// carries a command starting with one of these prefixes
    /// (case-insensitive).
    #[serde(default)]
    pub ignore_error_command_prefixes: Vec<String>,
}

/// [`ChangesetInterceptor`] driven by [`InterceptorRules`].
#[derive(Debug, Clone, Default)]
pub struct RuleInterceptor {
    rules: InterceptorRules,
}

impl RuleInterceptor {
    pub fn new(rules: InterceptorRules) -> Self {
        Self { rules }
    }

    /// Loads rules from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ReplicationError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ReplicationError::Interceptor(format!("{}: {e}", path.display())))?;
        let rules: InterceptorRules = toml::from_str(&source)
            .map_err(|e| ReplicationError::Interceptor(format!("{}: {e}", path.display())))?;
        Ok(Self::new(rules))
    }

    fn matches_ignored_command(&self, changeset: &Changeset) -> bool {
        changeset.changes.iter().any(|change| {
            let Some(command) = change.command.as_deref() else {
                return false;
            };
            let command = command.trim_start().to_uppercase();
            self.rules
                .ignore_error_command_prefixes
                .iter()
                .any(|prefix| command.starts_with(&prefix.trim_start().to_uppercase()))
        })
    }
}

impl ChangesetInterceptor for RuleInterceptor {
    fn before_apply(&self, changeset: &Changeset) -> Result<bool, ReplicationError> {
        Ok(self.rules.skip_nodes.contains(&changeset.node))
    }

    fn after_apply(
        &self,
        changeset: &Changeset,
        outcome: Result<(), ReplicationError>,
    ) -> Result<(), ReplicationError> {
        match outcome {
            Err(error) if self.matches_ignored_command(changeset) => {
                tracing::warn!(%error, node = %changeset.node, "apply error ignored by interceptor rule");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_cdc::Change;

    fn alter_table_changeset() -> Changeset {
        Changeset::new("node-b", vec![Change::sql("ALTER TABLE users ADD COLUMN x")])
    }

    #[test]
    fn parses_rule_file_syntax() {
        let rules: InterceptorRules = toml::from_str(
            r#"
skip-nodes = ["reporting-1"]
ignore-error-command-prefixes = ["ALTER TABLE"]
"#,
        )
        .unwrap();
        assert_eq!(rules.skip_nodes, ["reporting-1"]);
        assert_eq!(rules.ignore_error_command_prefixes, ["ALTER TABLE"]);
    }

    #[test]
    fn skips_configured_origins() {
        let interceptor = RuleInterceptor::new(InterceptorRules {
            skip_nodes: vec!["reporting-1".to_string()],
            ..Default::default()
        });
        let mut cs = alter_table_changeset();
        cs.node = "reporting-1".to_string();
        assert!(interceptor.before_apply(&cs).unwrap());
        cs.node = "primary".to_string();
        assert!(!interceptor.before_apply(&cs).unwrap());
    }

    #[test]
    fn swallows_matching_apply_errors() {
        let interceptor = RuleInterceptor::new(InterceptorRules {
            ignore_error_command_prefixes: vec!["ALTER TABLE".to_string()],
            ..Default::default()
        });
        let cs = alter_table_changeset();
        let failed = Err(ReplicationError::Snapshot("boom".into()));
        assert!(interceptor.after_apply(&cs, failed).is_ok());
    }

    #[test]
    fn propagates_non_matching_apply_errors() {
        let interceptor = RuleInterceptor::new(InterceptorRules {
            ignore_error_command_prefixes: vec!["ALTER TABLE".to_string()],
            ..Default::default()
        });
        let cs = Changeset::new("node-b", vec![Change::sql("DROP TABLE users")]);
        let failed = Err(ReplicationError::Snapshot("boom".into()));
        assert!(interceptor.after_apply(&cs, failed).is_err());
    }

    #[test]
    fn default_hooks_are_transparent() {
        struct Noop;
        impl ChangesetInterceptor for Noop {}
        let cs = alter_table_changeset();
        assert!(!Noop.before_apply(&cs).unwrap());
        assert!(Noop.after_apply(&cs, Ok(())).is_ok());
        assert!(Noop
            .after_apply(&cs, Err(ReplicationError::Snapshot("x".into())))
            .is_err());
    }
}
