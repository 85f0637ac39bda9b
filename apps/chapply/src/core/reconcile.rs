//! # Reconciliation pipeline
//!
//! One resource, one sequential pass: read current state from the system
//! catalogs, diff against desired state, plan statements, execute (or
//! simulate). The batch driver runs the pipeline over every resource a state
//! file declares; a read-privilege problem on one resource degrades to a
//! warning instead of aborting the batch, while an execution failure stops
//! the run at the failing resource.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::descriptor::{ResourceDescriptor, ResourceKind};
use super::diff::{diff, Diff};
use super::execute::{apply, ReconciliationResult, StatementRunner};
use super::plan::Statement;
use super::state::{ObservedState, StateMap};
use crate::infrastructure::olap::clickhouse::{ClickhouseError, ServerVersion};

/// The single desired end-state transition one invocation reconciles.
/// Create/alter, drop, and rename are mutually exclusive per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Present,
    Absent,
    Rename { target: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Clickhouse(#[from] ClickhouseError),

    #[error("grantee '{0}' does not exist as a user or role")]
    GranteeNotFound(String),

    #[error("{kind} '{name}': {message}")]
    InvalidDefinition {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("cannot rename {kind}: neither '{from}' nor '{to}' exists")]
    RenameMissing {
        kind: ResourceKind,
        from: String,
        to: String,
    },
}

/// One manageable resource: its descriptor table, how to read its current
/// state, and how to render the statements the generic pipeline decides on.
#[async_trait]
pub trait Resource: Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn name(&self) -> &str;
    fn cluster(&self) -> Option<&str>;
    fn transition(&self) -> Transition;
    fn descriptor(&self) -> &'static ResourceDescriptor;

    /// Desired attributes after version gating. Attributes the target cannot
    /// express are dropped here with a warning, never sent and rejected.
    fn desired(&self, version: Option<&ServerVersion>) -> (StateMap, Vec<String>);

    /// Reads the current state of `name` from the target's system catalogs.
    /// Read-only; `name` is parameterized so rename can inspect both
    /// endpoints, and the server version selects which catalog columns are
    /// safe to query.
    async fn read(
        &self,
        runner: &dyn StatementRunner,
        version: Option<&ServerVersion>,
        name: &str,
    ) -> Result<ObservedState, ReconcileError>;

    fn plan_create(&self, desired: &StateMap) -> Result<Vec<Statement>, ReconcileError>;

    /// `desired` is the full gated desired state; some kinds (quota) render
    /// one statement carrying every clause, not just the changed ones.
    fn plan_alter(&self, desired: &StateMap, diff: &Diff)
        -> Result<Vec<Statement>, ReconcileError>;
    fn plan_drop(&self, current: &StateMap) -> Vec<Statement>;

    fn plan_rename(&self, _target: &str) -> Result<Statement, ReconcileError> {
        Err(ReconcileError::InvalidDefinition {
            kind: self.kind(),
            name: self.name().to_string(),
            message: format!("rename is not supported for {}s", self.kind()),
        })
    }
}

/// Runs the read -> diff -> plan -> execute pipeline for one resource.
///
/// Planning-time problems (ambiguous rename, nothing to rename) recover
/// locally into warnings; definition and execution errors surface as a failed
/// result carrying whatever was applied before the failure.
pub async fn reconcile_resource(
    runner: &dyn StatementRunner,
    version: Option<&ServerVersion>,
    resource: &dyn Resource,
    dry_run: bool,
) -> ReconciliationResult {
    let mut warnings = Vec::new();

    let observed =
        match read_degrading(runner, version, resource, resource.name(), &mut warnings).await {
            Ok(o) => o,
            Err(e) => return ReconciliationResult::failure(e.to_string(), warnings),
        };

    let (desired, gate_warnings) = resource.desired(version);
    warnings.extend(gate_warnings);

    let planned: Result<Vec<Statement>, ReconcileError> = match resource.transition() {
        Transition::Present => match &observed {
            ObservedState::NotFound => resource.plan_create(&desired),
            ObservedState::Present(_) => {
                let d = diff(resource.descriptor(), &desired, &observed);
                warnings.extend(d.warnings.iter().cloned());
                if d.is_empty() {
                    Ok(Vec::new())
                } else {
                    resource.plan_alter(&desired, &d)
                }
            }
        },
        Transition::Absent => match &observed {
            ObservedState::Present(current) => Ok(resource.plan_drop(current)),
            ObservedState::NotFound => Ok(Vec::new()),
        },
        Transition::Rename { target } => {
            let target_observed =
                match read_degrading(runner, version, resource, &target, &mut warnings).await {
                    Ok(o) => o,
                    Err(e) => return ReconciliationResult::failure(e.to_string(), warnings),
                };
            match (observed.is_found(), target_observed.is_found()) {
                // Both endpoints exist: the intended direction is unresolvable
                (true, true) => {
                    warn!(
                        "ambiguous rename: both '{}' and '{}' exist",
                        resource.name(),
                        target
                    );
                    warnings.push(format!(
                        "ambiguous rename: both '{}' and '{}' exist; not planning a statement",
                        resource.name(),
                        target
                    ));
                    Ok(Vec::new())
                }
                (true, false) => resource.plan_rename(&target).map(|s| vec![s]),
                (false, true) => {
                    warnings.push(format!(
                        "'{}' already renamed to '{}'; nothing to do",
                        resource.name(),
                        target
                    ));
                    Ok(Vec::new())
                }
                (false, false) => Err(ReconcileError::RenameMissing {
                    kind: resource.kind(),
                    from: resource.name().to_string(),
                    to: target,
                }),
            }
        }
    };

    match planned {
        Ok(statements) => apply(runner, &statements, warnings, dry_run).await,
        Err(e) => ReconciliationResult::failure(e.to_string(), warnings),
    }
}

/// Reads observed state, degrading a privilege-denied read to
/// NotFound-with-warning so a restricted resource doesn't abort the batch.
async fn read_degrading(
    runner: &dyn StatementRunner,
    version: Option<&ServerVersion>,
    resource: &dyn Resource,
    name: &str,
    warnings: &mut Vec<String>,
) -> Result<ObservedState, ReconcileError> {
    match resource.read(runner, version, name).await {
        Ok(observed) => Ok(observed),
        Err(ReconcileError::Clickhouse(e)) if e.is_privilege_denied() => {
            warnings.push(format!(
                "not enough privileges to inspect {} '{}'; assuming absent",
                resource.kind(),
                name
            ));
            Ok(ObservedState::NotFound)
        }
        Err(e) => Err(e),
    }
}

/// Per-resource entry in the run report.
#[derive(Debug, Serialize)]
pub struct ResourceReport {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(flatten)]
    pub result: ReconciliationResult,
}

/// Aggregate of one invocation over a whole state file.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub changed: bool,
    pub failed: bool,
    pub executed_statements: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub results: Vec<ResourceReport>,
}

/// Reconciles every resource in declaration order. A failed resource stops
/// the run; everything applied up to that point stays in the report.
pub async fn reconcile_all(
    runner: &dyn StatementRunner,
    version: Option<&ServerVersion>,
    resources: &[Box<dyn Resource>],
    dry_run: bool,
) -> RunReport {
    let mut report = RunReport::default();

    for resource in resources {
        info!(
            "Reconciling {} '{}'{}",
            resource.kind(),
            resource.name(),
            if dry_run { " (check mode)" } else { "" }
        );
        let result = reconcile_resource(runner, version, resource.as_ref(), dry_run).await;

        report.changed |= result.changed;
        report
            .executed_statements
            .extend(result.executed_statements.iter().cloned());
        report.warnings.extend(result.warnings.iter().cloned());

        let failed = result.failed;
        if failed {
            report.failed = true;
            report.error_message = result.error_message.clone();
        }

        report.results.push(ResourceReport {
            kind: resource.kind(),
            name: resource.name().to_string(),
            result,
        });

        if failed {
            break;
        }
    }

    report
}
