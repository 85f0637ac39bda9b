//! # Executor
//!
//! Applies a planned statement sequence against the target, or simulates it
//! in dry-run mode. Each statement is its own unit of durability: there is no
//! multi-statement transaction, execution stops at the first failure, and
//! already-applied statements are not rolled back.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::plan::Statement;
use crate::infrastructure::olap::clickhouse::ClickhouseError;

/// The seam between planned statements and the transport. The real
/// implementation is the ClickHouse HTTP client; tests substitute a mock.
#[async_trait]
pub trait StatementRunner: Send + Sync {
    /// Executes one statement and returns response rows (empty for DDL).
    async fn run(&self, sql: &str) -> Result<Vec<Vec<String>>, ClickhouseError>;
}

/// Outcome of reconciling one resource, marshaled back to the caller as-is.
#[derive(Debug, Default, Serialize)]
pub struct ReconciliationResult {
    pub changed: bool,
    pub executed_statements: Vec<String>,
    pub warnings: Vec<String>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReconciliationResult {
    pub fn failure(message: String, warnings: Vec<String>) -> Self {
        Self {
            changed: false,
            executed_statements: Vec::new(),
            warnings,
            failed: true,
            error_message: Some(message),
        }
    }
}

/// Applies the plan in order.
///
/// Dry-run returns the statements as executed without contacting the target;
/// `changed` reflects what would happen. In real mode a statement failure
/// terminates the loop: the result carries the statements applied so far and
/// the error, and the remaining plan is not attempted.
pub async fn apply(
    runner: &dyn StatementRunner,
    statements: &[Statement],
    warnings: Vec<String>,
    dry_run: bool,
) -> ReconciliationResult {
    let mut result = ReconciliationResult {
        warnings,
        ..Default::default()
    };

    for statement in statements {
        if dry_run {
            info!("[check] would execute: {}", statement.display());
            result.executed_statements.push(statement.display_sql.clone());
            continue;
        }

        info!("Executing: {}", statement.display());
        match runner.run(&statement.sql).await {
            Ok(_) => result.executed_statements.push(statement.display_sql.clone()),
            Err(e) => {
                warn!("Statement failed, aborting remaining plan: {}", e);
                result.failed = true;
                result.error_message = Some(e.to_string());
                break;
            }
        }
    }

    result.changed = !result.executed_statements.is_empty();
    result
}


#[cfg(test)]
mod tests {
    use super::test_support::MockRunner;
    use super::*;
    use crate::core::plan::{StatementBuilder, StatementKind};

    fn statement(sql: &str) -> Statement {
        StatementBuilder::new(StatementKind::CreateRole, sql.to_string()).build(None)
    }

    #[tokio::test]
    async fn test_dry_run_contacts_nothing() {
        let runner = MockRunner::new();
        let plan = vec![statement("CREATE ROLE `a`"), statement("CREATE ROLE `b`")];
        let result = apply(&runner, &plan, vec![], true).await;

        assert!(result.changed);
        assert!(!result.failed);
        assert_eq!(result.executed_statements.len(), 2);
        assert!(runner.executed().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_is_unchanged() {
        let runner = MockRunner::new();
        let result = apply(&runner, &[], vec![], false).await;
        assert!(!result.changed);
        assert!(result.executed_statements.is_empty());
        assert!(!result.failed);
    }

    #[tokio::test]
    async fn test_real_mode_executes_in_order() {
        let runner = MockRunner::new();
        let plan = vec![statement("CREATE ROLE `a`"), statement("CREATE ROLE `b`")];
        let result = apply(&runner, &plan, vec![], false).await;

        assert!(result.changed);
        assert_eq!(
            runner.executed(),
            vec!["CREATE ROLE `a`".to_string(), "CREATE ROLE `b`".to_string()]
        );
        assert_eq!(result.executed_statements.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_stops_the_loop() {
        // 3-statement plan failing at #2: one executed, failed, #3 untouched
        let runner = MockRunner::failing_on("`b`");
        let plan = vec![
            statement("CREATE ROLE `a`"),
            statement("CREATE ROLE `b`"),
            statement("CREATE ROLE `c`"),
        ];
        let result = apply(&runner, &plan, vec![], false).await;

        assert!(result.failed);
        assert_eq!(result.executed_statements.len(), 1);
        assert_eq!(result.executed_statements[0], "CREATE ROLE `a`");
        assert!(result.error_message.is_some());
        assert_eq!(runner.executed(), vec!["CREATE ROLE `a`".to_string()]);
        // executed one statement before failing, so the target did change
        assert!(result.changed);
    }

    #[tokio::test]
    async fn test_warnings_are_carried_through() {
        let runner = MockRunner::new();
        let result = apply(&runner, &[], vec!["heads up".to_string()], false).await;
        assert_eq!(result.warnings, vec!["heads up".to_string()]);
    }
}
