//! # State file
//!
//! The TOML document describing desired state. Entries are validated up
//! front, before any connection is made, and handed to the pipeline in a
//! fixed order (databases, roles, users, grants, quotas) so that principals
//! exist by the time grants and quotas reference them.

use std::path::Path;

use serde::Deserialize;

use crate::core::reconcile::Resource;
use crate::resources::database::DatabaseEntry;
use crate::resources::grants::GrantsEntry;
use crate::resources::quota::QuotaEntry;
use crate::resources::role::RoleEntry;
use crate::resources::user::UserEntry;

#[derive(Debug, thiserror::Error)]
pub enum StateFileError {
    #[error("cannot read state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse state file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {kind} '{name}': {message}")]
    Invalid {
        kind: &'static str,
        name: String,
        message: String,
    },
}

/// Optional `[connection]` section; CLI flags take precedence over it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
    #[serde(default)]
    pub roles: Vec<RoleEntry>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub grants: Vec<GrantsEntry>,
    #[serde(default)]
    pub quotas: Vec<QuotaEntry>,
}

impl StateFile {
    pub fn load(path: &Path) -> Result<Self, StateFileError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, StateFileError> {
        let file: StateFile = toml::from_str(contents)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), StateFileError> {
        let invalid = |kind: &'static str, name: &str, message: String| StateFileError::Invalid {
            kind,
            name: name.to_string(),
            message,
        };

        for e in &self.databases {
            e.validate().map_err(|m| invalid("database", &e.name, m))?;
        }
        for e in &self.roles {
            e.validate().map_err(|m| invalid("role", &e.name, m))?;
        }
        for e in &self.users {
            e.validate().map_err(|m| invalid("user", &e.name, m))?;
        }
        for e in &self.grants {
            e.validate().map_err(|m| invalid("grant", &e.grantee, m))?;
        }
        for e in &self.quotas {
            e.validate().map_err(|m| invalid("quota", &e.name, m))?;
        }
        Ok(())
    }

    /// Scopes every entry without its own cluster to `cluster`.
    pub fn apply_default_cluster(&mut self, cluster: &str) {
        let default = || Some(cluster.to_string());
        for e in &mut self.databases {
            e.cluster = e.cluster.take().or_else(default);
        }
        for e in &mut self.roles {
            e.cluster = e.cluster.take().or_else(default);
        }
        for e in &mut self.users {
            e.cluster = e.cluster.take().or_else(default);
        }
        for e in &mut self.grants {
            e.cluster = e.cluster.take().or_else(default);
        }
        for e in &mut self.quotas {
            e.cluster = e.cluster.take().or_else(default);
        }
    }

    /// The entries as pipeline resources, in reconciliation order.
    pub fn resources(&self) -> Vec<Box<dyn Resource>> {
        let mut resources: Vec<Box<dyn Resource>> = Vec::new();
        resources.extend(
            self.databases
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn Resource>),
        );
        resources.extend(
            self.roles
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn Resource>),
        );
        resources.extend(
            self.users
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn Resource>),
        );
        resources.extend(
            self.grants
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn Resource>),
        );
        resources.extend(
            self.quotas
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn Resource>),
        );
        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::ResourceKind;

    const EXAMPLE: &str = r#"
[connection]
url = "http://default@localhost:8123"

[[databases]]
name = "analytics"
engine = "Atomic"

[[roles]]
name = "reader"

[[users]]
name = "alice"
password = "qwerty"
roles = ["reader"]

[[grants]]
grantee = "alice"
[[grants.privileges]]
object = "analytics.*"
privs = { SELECT = false }

[[quotas]]
name = "q1"
keyed_by = "user_name"
apply_to = ["alice"]
[[quotas.limits]]
interval = "5 minute"
max = { queries = 100, execution_time = 100.5 }
"#;

    #[test]
    fn test_parse_full_example() {
        let file = StateFile::parse(EXAMPLE).unwrap();
        assert_eq!(file.connection.url.as_deref(), Some("http://default@localhost:8123"));
        assert_eq!(file.databases.len(), 1);
        assert_eq!(file.users[0].roles.as_deref(), Some(&["reader".to_string()][..]));
        assert_eq!(file.quotas[0].limits[0].max["queries"], 100.0);
    }

    #[test]
    fn test_resources_come_out_in_dependency_order() {
        let file = StateFile::parse(EXAMPLE).unwrap();
        let kinds: Vec<ResourceKind> = file.resources().iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Database,
                ResourceKind::Role,
                ResourceKind::User,
                ResourceKind::Grant,
                ResourceKind::Quota,
            ]
        );
    }

    #[test]
    fn test_validation_failures_are_reported_with_context() {
        let err = StateFile::parse(
            r#"
[[databases]]
name = "db"
state = "rename"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid database 'db'"));
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn test_default_cluster_does_not_override_explicit_one() {
        let mut file = StateFile::parse(
            r#"
[[roles]]
name = "a"

[[roles]]
name = "b"
cluster = "other"
"#,
        )
        .unwrap();
        file.apply_default_cluster("main");
        assert_eq!(file.roles[0].cluster.as_deref(), Some("main"));
        assert_eq!(file.roles[1].cluster.as_deref(), Some("other"));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            StateFile::parse("[[users]]\nname ="),
            Err(StateFileError::Parse(_))
        ));
    }
}
