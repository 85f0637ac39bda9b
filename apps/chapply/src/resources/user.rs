//! Users: authentication method plus role membership. The password value
//! itself is never read back or compared; the diff works on the auth type,
//! and the secret only ever appears in the executed SQL, redacted everywhere
//! else.

use std::collections::BTreeSet;

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;

use super::{transition_for, EntryState};
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
use crate::infrastructure::olap::clickhouse::errors::is_valid_clickhouse_identifier;
use crate::infrastructure::olap::clickhouse::ServerVersion;

static USER_ATTRIBUTES_APPEND: &[AttributeSpec] = &[
    AttributeSpec {
        name: "auth",
        policy: MergePolicy::Replace,
        mutability: Mutability::Mutable,
    },
    AttributeSpec {
        name: "roles",
        policy: MergePolicy::SetUnion,
        mutability: Mutability::Mutable,
    },
];

static USER_ATTRIBUTES_REPLACE: &[AttributeSpec] = &[
    AttributeSpec {
        name: "auth",
        policy: MergePolicy::Replace,
        mutability: Mutability::Mutable,
    },
    AttributeSpec {
        name: "roles",
        policy: MergePolicy::SetReplace,
        mutability: Mutability::Mutable,
    },
];

pub static USER_DESCRIPTOR_APPEND: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::User,
    attributes: USER_ATTRIBUTES_APPEND,
};

pub static USER_DESCRIPTOR_REPLACE: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::User,
    attributes: USER_ATTRIBUTES_REPLACE,
};

/// Whether `roles` is a lower bound (append) or the exact membership
/// (replace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolesMode {
    #[default]
    Append,
    Replace,
}

fn default_password_type() -> String {
    "sha256_password".to_string()
}

/// One `[[users]]` entry from the state file.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_password_type")]
    pub password_type: String,
    /// `None` leaves membership untouched; `Some(vec![])` with
    /// `roles_mode = "replace"` strips every role.
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub roles_mode: RolesMode,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub state: EntryState,
}

impl UserEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("user name cannot be empty".to_string());
        }
        if self.state == EntryState::Rename {
            return Err("users cannot be renamed".to_string());
        }
        if !is_valid_clickhouse_identifier(&self.password_type) {
            return Err(format!(
                "'{}' is not a valid authentication type",
                self.password_type
            ));
        }
        if let Some(roles) = &self.roles {
            if roles.iter().any(|r| r.is_empty()) {
                return Err("role names cannot be empty".to_string());
            }
        }
        Ok(())
    }

    fn identified_clause(&self) -> Option<(String, String)> {
        self.password.as_ref().map(|password| {
            (
                format!(
                    "IDENTIFIED WITH {} BY '{}'",
                    self.password_type,
                    escape_string_literal(password)
                ),
                format!("IDENTIFIED WITH {} BY '*****'", self.password_type),
            )
        })
    }
}

/// `system.users.auth_type` renders as a bare value on older servers and as
/// an array literal like `['sha256_password']` on newer ones.
fn parse_auth_type(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    inner
        .split(',')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('\'')
        .to_string()
}

fn as_set(value: Option<&AttrValue>) -> BTreeSet<String> {
    match value {
        Some(AttrValue::StrSet(s)) => s.clone(),
        _ => BTreeSet::new(),
    }
}

fn quoted_list(names: &BTreeSet<String>) -> String {
    names.iter().map(|n| quote_identifier(n)).join(", ")
}

#[async_trait]
impl Resource for UserEntry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::User
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
        match self.roles_mode {
            RolesMode::Append => &USER_DESCRIPTOR_APPEND,
            RolesMode::Replace => &USER_DESCRIPTOR_REPLACE,
        }
    }

    fn desired(&self, _version: Option<&ServerVersion>) -> (StateMap, Vec<String>) {
        let mut map = StateMap::new();
        if self.password.is_some() {
            map.insert("auth".to_string(), AttrValue::Str(self.password_type.clone()));
        }
        if let Some(roles) = &self.roles {
            map.insert("roles".to_string(), AttrValue::str_set(roles.clone()));
        }
        (map, Vec::new())
    }

    async fn read(
        &self,
        runner: &dyn StatementRunner,
        _version: Option<&ServerVersion>,
        name: &str,
    ) -> Result<ObservedState, ReconcileError> {
        let escaped = escape_string_literal(name);
        let sql = format!(
            "SELECT name, storage, auth_type FROM system.users WHERE name = '{escaped}'"
        );
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        let Some(row) = rows.first() else {
            return Ok(ObservedState::NotFound);
        };

        let mut map = StateMap::new();
        if let Some(auth_type) = row.get(2) {
            map.insert("auth".to_string(), AttrValue::Str(parse_auth_type(auth_type)));
        }

        let sql = format!(
            "SELECT granted_role_name FROM system.role_grants WHERE user_name = '{escaped}'"
        );
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        let roles: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| row.first().cloned())
            .collect();
        map.insert("roles".to_string(), AttrValue::StrSet(roles));

        Ok(ObservedState::Present(map))
    }

    fn plan_create(&self, desired: &StateMap) -> Result<Vec<Statement>, ReconcileError> {
        let mut builder = StatementBuilder::new(
            StatementKind::CreateUser,
            format!("CREATE USER {}", quote_identifier(&self.name)),
        );
        if let Some((clause, display)) = self.identified_clause() {
            builder = builder.secret_clause(clause, display);
        }
        let mut statements = vec![builder.build(self.cluster())];

        let roles = as_set(desired.get("roles"));
        if !roles.is_empty() {
            statements.push(
                StatementBuilder::new(
                    StatementKind::Grant,
                    format!("GRANT {} TO {}", quoted_list(&roles), quote_identifier(&self.name)),
                )
                .build(self.cluster()),
            );
        }
        Ok(statements)
    }

    fn plan_alter(
        &self,
        _desired: &StateMap,
        diff: &Diff,
    ) -> Result<Vec<Statement>, ReconcileError> {
        let mut statements = Vec::new();

        if diff.change("auth").is_some() {
            let Some((clause, display)) = self.identified_clause() else {
                return Err(ReconcileError::InvalidDefinition {
                    kind: self.kind(),
                    name: self.name.clone(),
                    message: "cannot change authentication without a password".to_string(),
                });
            };
            statements.push(
                StatementBuilder::new(
                    StatementKind::AlterUser,
                    format!("ALTER USER {}", quote_identifier(&self.name)),
                )
                .secret_clause(clause, display)
                .build(self.cluster()),
            );
        }

        if let Some(change) = diff.change("roles") {
            // `to` is already merged per policy: union in append mode, the
            // literal desired set in replace mode.
            let current = as_set(change.from.as_ref());
            let target = as_set(Some(&change.to));

            let to_revoke: BTreeSet<String> = current.difference(&target).cloned().collect();
            let to_grant: BTreeSet<String> = target.difference(&current).cloned().collect();

            if !to_revoke.is_empty() {
                statements.push(
                    StatementBuilder::new(
                        StatementKind::Revoke,
                        format!(
                            "REVOKE {} FROM {}",
                            quoted_list(&to_revoke),
                            quote_identifier(&self.name)
                        ),
                    )
                    .build(self.cluster()),
                );
            }
            if !to_grant.is_empty() {
                statements.push(
                    StatementBuilder::new(
                        StatementKind::Grant,
                        format!(
                            "GRANT {} TO {}",
                            quoted_list(&to_grant),
                            quote_identifier(&self.name)
                        ),
                    )
                    .build(self.cluster()),
                );
            }
        }

        Ok(statements)
    }

    fn plan_drop(&self, _current: &StateMap) -> Vec<Statement> {
        vec![StatementBuilder::new(
            StatementKind::DropUser,
            format!("DROP USER {}", quote_identifier(&self.name)),
        )
        .build(self.cluster())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execute::test_support::MockRunner;
    use crate::core::reconcile::reconcile_resource;

    fn entry(name: &str) -> UserEntry {
        UserEntry {
            name: name.to_string(),
            password: None,
            password_type: default_password_type(),
            roles: None,
            roles_mode: RolesMode::Append,
            cluster: None,
            state: EntryState::Present,
        }
    }

    fn existing(auth_type: &str, roles: &[&str]) -> MockRunner {
        MockRunner::new()
            .respond_with(
                "system.users",
                vec![vec![
                    "alice".to_string(),
                    "local_directory".to_string(),
                    format!("['{auth_type}']"),
                ]],
            )
            .respond_with(
                "system.role_grants",
                roles.iter().map(|r| vec![r.to_string()]).collect(),
            )
    }

    #[test]
    fn test_parse_auth_type_handles_both_renderings() {
        assert_eq!(parse_auth_type("sha256_password"), "sha256_password");
        assert_eq!(parse_auth_type("['sha256_password']"), "sha256_password");
        assert_eq!(
            parse_auth_type("['plaintext_password','ldap']"),
            "plaintext_password"
        );
    }

    #[tokio::test]
    async fn test_create_redacts_password_in_report() {
        let runner = MockRunner::new();
        let mut e = entry("alice");
        e.password = Some("qwerty".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(result.changed);
        assert_eq!(
            result.executed_statements,
            vec!["CREATE USER `alice` IDENTIFIED WITH sha256_password BY '*****'"]
        );
        // the real SQL sent to the server carries the secret
        assert!(runner
            .executed()
            .iter()
            .any(|sql| sql.contains("BY 'qwerty'")));
    }

    #[tokio::test]
    async fn test_create_grants_initial_roles() {
        let runner = MockRunner::new();
        let mut e = entry("alice");
        e.roles = Some(vec!["writer".to_string(), "reader".to_string()]);

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert_eq!(
            result.executed_statements,
            vec![
                "CREATE USER `alice`".to_string(),
                "GRANT `reader`, `writer` TO `alice`".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_append_mode_only_grants_missing_roles() {
        let runner = existing("sha256_password", &["reader"]);
        let mut e = entry("alice");
        e.roles = Some(vec!["writer".to_string()]);

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert_eq!(result.executed_statements, vec!["GRANT `writer` TO `alice`"]);
    }

    #[tokio::test]
    async fn test_append_mode_is_idempotent_for_subset() {
        let runner = existing("sha256_password", &["reader", "writer"]);
        let mut e = entry("alice");
        e.roles = Some(vec!["reader".to_string()]);

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(!result.changed);
        assert!(result.executed_statements.is_empty());
    }

    #[tokio::test]
    async fn test_replace_mode_revokes_extras_before_granting() {
        let runner = existing("sha256_password", &["stale", "reader"]);
        let mut e = entry("alice");
        e.roles = Some(vec!["reader".to_string(), "writer".to_string()]);
        e.roles_mode = RolesMode::Replace;

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert_eq!(
            result.executed_statements,
            vec![
                "REVOKE `stale` FROM `alice`".to_string(),
                "GRANT `writer` TO `alice`".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_auth_type_change_alters_user() {
        let runner = existing("plaintext_password", &[]);
        let mut e = entry("alice");
        e.password = Some("secret".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert_eq!(
            result.executed_statements,
            vec!["ALTER USER `alice` IDENTIFIED WITH sha256_password BY '*****'"]
        );
    }

    #[tokio::test]
    async fn test_matching_auth_type_never_touches_password() {
        let runner = existing("sha256_password", &[]);
        let mut e = entry("alice");
        e.password = Some("whatever".to_string());

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert!(!result.changed);
        assert!(result.executed_statements.is_empty());
    }

    #[tokio::test]
    async fn test_drop_user() {
        let runner = existing("sha256_password", &[]);
        let mut e = entry("alice");
        e.state = EntryState::Absent;

        let result = reconcile_resource(&runner, None, &e, false).await;
        assert_eq!(result.executed_statements, vec!["DROP USER `alice`"]);
    }

    #[test]
    fn test_validate_rejects_bad_auth_type() {
        let mut e = entry("alice");
        e.password_type = "sha256'; DROP USER".to_string();
        assert!(e.validate().is_err());
    }
}
