//! Roles: pure existence, no attributes. Privileges attached to a role are
//! managed through `[[grants]]` entries, membership through `[[users]]`.

use async_trait::async_trait;
use serde::Deserialize;

use super::{transition_for, EntryState};
use crate::core::descriptor::{ResourceDescriptor, ResourceKind};
use crate::core::diff::Diff;
use crate::core::execute::StatementRunner;
use crate::core::plan::{
    escape_string_literal, quote_identifier, Statement, StatementBuilder, StatementKind,
};
use crate::core::reconcile::{ReconcileError, Resource, Transition};
use crate::core::state::{ObservedState, StateMap};
use crate::infrastructure::olap::clickhouse::ServerVersion;

pub static ROLE_DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::Role,
    attributes: &[],
};

/// One `[[roles]]` entry from the state file.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleEntry {
    pub name: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub state: EntryState,
}

impl RoleEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("role name cannot be empty".to_string());
        }
        if self.state == EntryState::Rename {
            return Err("roles cannot be renamed".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for RoleEntry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Role
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    fn transition(&self) -> Transition {
        transition_for(self.state, None)
    }

    fn descriptor(&self) -> &'static ResourceDescriptor {
        &ROLE_DESCRIPTOR
    }

    fn desired(&self, _version: Option<&ServerVersion>) -> (StateMap, Vec<String>) {
        (StateMap::new(), Vec::new())
    }

    async fn read(
        &self,
        runner: &dyn StatementRunner,
        _version: Option<&ServerVersion>,
        name: &str,
    ) -> Result<ObservedState, ReconcileError> {
        let sql = format!(
            "SELECT 1 FROM system.roles WHERE name = '{}' LIMIT 1",
            escape_string_literal(name)
        );
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        if rows.is_empty() {
            Ok(ObservedState::NotFound)
        } else {
            Ok(ObservedState::Present(StateMap::new()))
        }
    }

    fn plan_create(&self, _desired: &StateMap) -> Result<Vec<Statement>, ReconcileError> {
        Ok(vec![StatementBuilder::new(
            StatementKind::CreateRole,
            format!("CREATE ROLE {}", quote_identifier(&self.name)),
        )
        .build(self.cluster())])
    }

    fn plan_alter(
        &self,
        _desired: &StateMap,
        _diff: &Diff,
    ) -> Result<Vec<Statement>, ReconcileError> {
        // no attributes, so a non-empty diff cannot occur
        Ok(Vec::new())
    }

    fn plan_drop(&self, _current: &StateMap) -> Vec<Statement> {
        vec![StatementBuilder::new(
            StatementKind::DropRole,
            format!("DROP ROLE {}", quote_identifier(&self.name)),
        )
        .build(self.cluster())]
    }
}
