//! Databases: engine is fixed at creation, comments can be set once on
//! servers that support them, and this is the only kind with a rename form.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{str_attr, transition_for, EntryState};
use crate::core::descriptor::{
    AttrValue, AttributeSpec, MergePolicy, Mutability, ResourceDescriptor, ResourceKind,
};
use crate::core::diff::Diff;
use crate::core::execute::StatementRunner;
use crate::core::plan::{
    escape_string_literal, quote_identifier, Statement, StatementBuilder, StatementKind,
};
use crate::core::reconcile::{ReconcileError, Resource, Transition};
use crate::core::state::{ObservedState, StateMap};
use crate::infrastructure::olap::clickhouse::ServerVersion;

/// Canonical attribute order: engine before comment.
static DATABASE_ATTRIBUTES: &[AttributeSpec] = &[
    AttributeSpec {
        name: "engine",
        policy: MergePolicy::Replace,
        mutability: Mutability::CreateOnly,
    },
    AttributeSpec {
        name: "comment",
        policy: MergePolicy::ImmutableOnceSet,
        mutability: Mutability::Mutable,
    },
];

pub static DATABASE_DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::Database,
    attributes: DATABASE_ATTRIBUTES,
};

/// Engine expressions are interpolated into DDL unquoted, so they are held
/// to a name-with-optional-arguments shape instead of being escaped.
static ENGINE_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\([^;]*\))?$").expect("hardcoded regex is valid")
});

/// One `[[databases]]` entry from the state file.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub state: EntryState,
    /// New name, `state = "rename"` only.
    #[serde(default)]
    pub target: Option<String>,
}

impl DatabaseEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("database name cannot be empty".to_string());
        }
        match (self.state, &self.target) {
            (EntryState::Rename, None) => {
                return Err("state = \"rename\" requires a target name".to_string());
            }
            (EntryState::Rename, Some(t)) if t.is_empty() => {
                return Err("rename target cannot be empty".to_string());
            }
            (EntryState::Present | EntryState::Absent, Some(_)) => {
                return Err("target is only valid with state = \"rename\"".to_string());
            }
            _ => {}
        }
        if let Some(engine) = &self.engine {
            if !ENGINE_EXPR.is_match(engine) {
                return Err(format!("'{engine}' is not a valid database engine expression"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for DatabaseEntry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    fn transition(&self) -> Transition {
        transition_for(self.state, self.target.as_deref())
    }

    fn descriptor(&self) -> &'static ResourceDescriptor {
        &DATABASE_DESCRIPTOR
    }

    fn desired(&self, version: Option<&ServerVersion>) -> (StateMap, Vec<String>) {
        let mut map = StateMap::new();
        let mut warnings = Vec::new();

        if let Some(engine) = &self.engine {
            map.insert("engine".to_string(), AttrValue::Str(engine.clone()));
        }
        if let Some(comment) = &self.comment {
            match version {
                Some(v) if !v.supports_entity_comments() => {
                    warnings.push(format!(
                        "database comments are not supported by server version {}; \
                         ignoring the comment for '{}'",
                        v.raw, self.name
                    ));
                }
                _ => {
                    map.insert("comment".to_string(), AttrValue::Str(comment.clone()));
                }
            }
        }

        (map, warnings)
    }

    async fn read(
        &self,
        runner: &dyn StatementRunner,
        version: Option<&ServerVersion>,
        name: &str,
    ) -> Result<ObservedState, ReconcileError> {
        let with_comment = version.map(|v| v.supports_entity_comments()).unwrap_or(true);
        let columns = if with_comment { "engine, comment" } else { "engine" };
        let sql = format!(
            "SELECT {columns} FROM system.databases WHERE name = '{}'",
            escape_string_literal(name)
        );

        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        let Some(row) = rows.first() else {
            return Ok(ObservedState::NotFound);
        };

        let mut map = StateMap::new();
        if let Some(engine) = row.first() {
            map.insert("engine".to_string(), AttrValue::Str(engine.clone()));
        }
        if with_comment {
            if let Some(comment) = row.get(1) {
                map.insert("comment".to_string(), AttrValue::Str(comment.clone()));
            }
        }
        Ok(ObservedState::Present(map))
    }

    fn plan_create(&self, desired: &StateMap) -> Result<Vec<Statement>, ReconcileError> {
        let statement = StatementBuilder::new(
            StatementKind::CreateDatabase,
            format!("CREATE DATABASE {}", quote_identifier(&self.name)),
        )
        .clause_opt(str_attr(desired, "engine").map(|e| format!("ENGINE = {e}")))
        .clause_opt(
            str_attr(desired, "comment")
                .map(|c| format!("COMMENT '{}'", escape_string_literal(&c))),
        )
        .build(self.cluster());
        Ok(vec![statement])
    }

    fn plan_alter(
        &self,
        _desired: &StateMap,
        diff: &Diff,
    ) -> Result<Vec<Statement>, ReconcileError> {
        let mut statements = Vec::new();
        for change in &diff.changes {
            match change.name.as_str() {
                // only reachable when the current comment is empty
                "comment" => {
                    if let AttrValue::Str(comment) = &change.to {
                        statements.push(
                            StatementBuilder::new(
                                StatementKind::AlterDatabase,
                                format!("ALTER DATABASE {}", quote_identifier(&self.name)),
                            )
                            .clause(format!(
                                "MODIFY COMMENT '{}'",
                                escape_string_literal(comment)
                            ))
                            .build(self.cluster()),
                        );
                    }
                }
                other => {
                    return Err(ReconcileError::InvalidDefinition {
                        kind: self.kind(),
                        name: self.name.clone(),
                        message: format!("attribute '{other}' cannot be altered"),
                    });
                }
            }
        }
        Ok(statements)
    }

    fn plan_drop(&self, _current: &StateMap) -> Vec<Statement> {
        vec![StatementBuilder::new(
            StatementKind::DropDatabase,
            format!("DROP DATABASE {}", quote_identifier(&self.name)),
        )
        .build(self.cluster())]
    }

    fn plan_rename(&self, target: &str) -> Result<Statement, ReconcileError> {
        Ok(StatementBuilder::new(
            StatementKind::RenameDatabase,
            format!(
                "RENAME DATABASE {} TO {}",
                quote_identifier(&self.name),
                quote_identifier(target)
            ),
        )
        .build(self.cluster()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execute::test_support::MockRunner;
    use crate::core::reconcile::reconcile_resource;

    fn entry(name: &str) -> DatabaseEntry {
        DatabaseEntry {
            name: name.to_string(),
            engine: None,
            comment: None,
            cluster: None,
            state: EntryState::Present,
            target: None,
        }
    }

    #[test]
    fn test_validate_rejects_rename_without_target() {
        let mut e = entry("db");
        e.state = EntryState::Rename;
        assert!(e.validate().is_err());
        e.target = Some("db2".to_string());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_engine() {
        let mut e = entry("db");
        e.engine = Some("Memory; DROP DATABASE prod".to_string());
        assert!(e.validate().is_err());
        e.engine = Some("Replicated('/clickhouse/db', 'shard1', 'replica1')".to_string());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_create_serializes_in_canonical_order_with_cluster() {
        let mut e = entry("foo");
        e.engine = Some("Memory".to_string());
        e.comment = Some("scratch".to_string());
        e.cluster = Some("c1".to_string());

        let (desired, _) = e.desired(None);
        let statements = e.plan_create(&desired).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "CREATE DATABASE `foo` ON CLUSTER `c1` ENGINE = Memory COMMENT 'scratch'"
        );
    }

    #[test]
    fn test_rename_puts_cluster_clause_at_the_end() {
        let mut e = entry("a");
        e.cluster = Some("c1".to_string());
        let statement = e.plan_rename("b").unwrap();
        assert_eq!(statement.sql, "RENAME DATABASE `a` TO `b` ON CLUSTER `c1`");
    }

    #[test]
    fn test_version_gate_drops_comment_with_warning() {
        let mut e = entry("db");
        e.comment = Some("x".to_string());
        let old = ServerVersion::parse("21.8.1.1").unwrap();
        let (desired, warnings) = e.desired(Some(&old));
        assert!(!desired.contains_key("comment"));
        assert_eq!(warnings.len(), 1);

        let new = ServerVersion::parse("24.1.2.3").unwrap();
        let (desired, warnings) = e.desired(Some(&new));
        assert!(desired.contains_key("comment"));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_creates_absent_database() {
        let runner = MockRunner::new();
        let mut e = entry("analytics");
        e.engine = Some("Atomic".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(result.changed);
        assert!(!result.failed);
        assert_eq!(
            result.executed_statements,
            vec!["CREATE DATABASE `analytics` ENGINE = Atomic".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_a_noop_when_state_matches() {
        let runner = MockRunner {
            rows: vec![vec!["Atomic".to_string(), "".to_string()]],
            ..MockRunner::new()
        };
        let mut e = entry("analytics");
        e.engine = Some("Atomic".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(!result.changed);
        assert!(result.executed_statements.is_empty());
        // only the introspection SELECT reached the runner
        assert_eq!(runner.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_warns_on_engine_mismatch_without_altering() {
        let runner = MockRunner {
            rows: vec![vec!["Atomic".to_string(), "".to_string()]],
            ..MockRunner::new()
        };
        let mut e = entry("analytics");
        e.engine = Some("Memory".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(!result.changed);
        assert!(!result.failed);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("only be set at creation"));
    }

    #[tokio::test]
    async fn test_ambiguous_rename_plans_nothing() {
        // Every read returns a row, so both endpoints look present.
        let runner = MockRunner {
            rows: vec![vec!["Atomic".to_string(), "".to_string()]],
            ..MockRunner::new()
        };
        let mut e = entry("old");
        e.state = EntryState::Rename;
        e.target = Some("new".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(!result.changed);
        assert!(!result.failed);
        assert!(result.executed_statements.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("ambiguous rename")));
    }

    #[tokio::test]
    async fn test_rename_of_missing_source_and_target_fails() {
        let runner = MockRunner::new();
        let mut e = entry("old");
        e.state = EntryState::Rename;
        e.target = Some("new".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(result.failed);
        assert!(result.error_message.unwrap().contains("neither"));
    }

    #[tokio::test]
    async fn test_check_mode_reports_without_executing_ddl() {
        let runner = MockRunner::new();
        let e = entry("analytics");

        let result = reconcile_resource(&runner, None, &e, true).await;
        assert!(result.changed);
        assert_eq!(result.executed_statements, vec!["CREATE DATABASE `analytics`"]);
        // only the introspection SELECT reached the runner
        assert_eq!(runner.executed().len(), 1);
    }
}
