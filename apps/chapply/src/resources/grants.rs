//! Privilege grants for a user or role. Current grants are recovered by
//! parsing `SHOW GRANTS FOR` output; desired and observed grants are both
//! normalized to sets of (privilege, object, grant_option) triples before
//! comparison so that ordering and quoting differences never register as
//! drift.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use itertools::Itertools;
use regex::Regex;
use serde::Deserialize;

use super::{transition_for, EntryState};
use crate::core::descriptor::{
    AttrValue, AttributeSpec, MergePolicy, Mutability, ResourceDescriptor, ResourceKind,
};
use crate::core::diff::Diff;
use crate::core::execute::StatementRunner;
use crate::core::plan::{
    escape_string_literal, quote_grant_object, quote_identifier, Statement, StatementBuilder,
    StatementKind,
};
use crate::core::reconcile::{ReconcileError, Resource, Transition};
use crate::core::state::{ObservedState, StateMap};
use crate::infrastructure::olap::clickhouse::ServerVersion;

static GRANT_ATTRIBUTES_APPEND: &[AttributeSpec] = &[AttributeSpec {
    name: "privileges",
    policy: MergePolicy::SetUnion,
    mutability: Mutability::Mutable,
}];

static GRANT_ATTRIBUTES_EXCLUSIVE: &[AttributeSpec] = &[AttributeSpec {
    name: "privileges",
    policy: MergePolicy::SetReplace,
    mutability: Mutability::Mutable,
}];

pub static GRANT_DESCRIPTOR_APPEND: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::Grant,
    attributes: GRANT_ATTRIBUTES_APPEND,
};

pub static GRANT_DESCRIPTOR_EXCLUSIVE: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::Grant,
    attributes: GRANT_ATTRIBUTES_EXCLUSIVE,
};

/// Matches one line of `SHOW GRANTS FOR` output. Granted-role lines
/// (`GRANT reader TO alice`) have no ON clause and deliberately fall through.
static GRANT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^GRANT (.+?) ON (.+?) TO .+?( WITH GRANT OPTION)?$")
        .expect("hardcoded regex is valid")
});

/// Privilege names: keywords, optionally with a column list, e.g.
/// `SELECT(name, email)`.
static PRIVILEGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9_ ]*(\([^()]*\))?$").expect("hardcoded regex is valid")
});

/// One privilege set on a single database object.
#[derive(Debug, Clone, Deserialize)]
pub struct PrivilegeSet {
    /// `*.*`, `db.*` or `db.table`.
    pub object: String,
    /// Privilege name -> WITH GRANT OPTION.
    pub privs: BTreeMap<String, bool>,
    /// Overrides every per-privilege grant option in this set.
    #[serde(default)]
    pub grant_option: Option<bool>,
}

/// One `[[grants]]` entry from the state file.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantsEntry {
    pub grantee: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub privileges: Vec<PrivilegeSet>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub state: EntryState,
}

impl GrantsEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.grantee.is_empty() {
            return Err("grantee cannot be empty".to_string());
        }
        match self.state {
            EntryState::Rename => return Err("grants cannot be renamed".to_string()),
            EntryState::Present if self.privileges.is_empty() => {
                return Err("state = \"present\" requires at least one privilege set".to_string());
            }
            _ => {}
        }
        for set in &self.privileges {
            let parts: Vec<&str> = set.object.splitn(2, '.').collect();
            if parts.iter().any(|p| p.is_empty()) || set.object.is_empty() {
                return Err(format!("'{}' is not a valid grant object", set.object));
            }
            if set.privs.is_empty() {
                return Err(format!("no privileges given for object '{}'", set.object));
            }
            for priv_name in set.privs.keys() {
                if !PRIVILEGE_NAME.is_match(&priv_name.to_uppercase()) {
                    return Err(format!("'{priv_name}' is not a valid privilege name"));
                }
            }
        }
        Ok(())
    }

    fn desired_triples(&self) -> BTreeSet<(String, String, bool)> {
        let mut triples = BTreeSet::new();
        for set in &self.privileges {
            let object = normalize_object(&set.object);
            for (priv_name, grant_option) in &set.privs {
                let effective = set.grant_option.unwrap_or(*grant_option);
                triples.insert((priv_name.to_uppercase(), object.clone(), effective));
            }
        }
        triples
    }
}

/// Strips backtick quoting and widens bare `*` (ClickHouse 25.x prints it for
/// global grants) to `*.*`, so both sides compare in one canonical spelling.
fn normalize_object(object: &str) -> String {
    if object == "*" {
        return "*.*".to_string();
    }
    object
        .splitn(2, '.')
        .map(|part| part.trim_matches('`'))
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_grant_lines(rows: &[Vec<String>]) -> BTreeSet<(String, String, bool)> {
    let mut triples = BTreeSet::new();
    for row in rows {
        let Some(line) = row.first() else { continue };
        let Some(captures) = GRANT_LINE.captures(line) else {
            continue;
        };
        let privs = &captures[1];
        let object = normalize_object(&captures[2]);
        let grant_option = captures.get(3).is_some();
        for priv_name in privs.split(',') {
            triples.insert((
                priv_name.trim().to_uppercase(),
                object.clone(),
                grant_option,
            ));
        }
    }
    triples
}

fn as_triples(value: Option<&AttrValue>) -> BTreeSet<(String, String, bool)> {
    match value {
        Some(AttrValue::GrantSet(s)) => s.clone(),
        _ => BTreeSet::new(),
    }
}

#[async_trait]
impl Resource for GrantsEntry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Grant
    }

    fn name(&self) -> &str {
        &self.grantee
    }

    fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    fn transition(&self) -> Transition {
        transition_for(self.state, None)
    }

    fn descriptor(&self) -> &'static ResourceDescriptor {
        if self.exclusive {
            &GRANT_DESCRIPTOR_EXCLUSIVE
        } else {
            &GRANT_DESCRIPTOR_APPEND
        }
    }

    fn desired(&self, _version: Option<&ServerVersion>) -> (StateMap, Vec<String>) {
        let mut map = StateMap::new();
        map.insert(
            "privileges".to_string(),
            AttrValue::GrantSet(self.desired_triples()),
        );
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
            "SELECT 1 FROM system.users WHERE name = '{escaped}' \
             UNION ALL \
             SELECT 1 FROM system.roles WHERE name = '{escaped}' \
             LIMIT 1"
        );
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        if rows.is_empty() {
            return Err(ReconcileError::GranteeNotFound(name.to_string()));
        }

        let sql = format!("SHOW GRANTS FOR {}", quote_identifier(name));
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;

        let mut map = StateMap::new();
        map.insert(
            "privileges".to_string(),
            AttrValue::GrantSet(parse_grant_lines(&rows)),
        );
        Ok(ObservedState::Present(map))
    }

    // Only reachable when the grants read degraded to NotFound; grants all
    // desired privileges with no revokes.
    fn plan_create(&self, desired: &StateMap) -> Result<Vec<Statement>, ReconcileError> {
        Ok(self.render_grants(&as_triples(desired.get("privileges"))))
    }

    fn plan_alter(
        &self,
        _desired: &StateMap,
        diff: &Diff,
    ) -> Result<Vec<Statement>, ReconcileError> {
        let Some(change) = diff.change("privileges") else {
            return Ok(Vec::new());
        };
        let current = as_triples(change.from.as_ref());
        let target = as_triples(Some(&change.to));

        let to_revoke: BTreeSet<_> = current.difference(&target).cloned().collect();
        let to_grant: BTreeSet<_> = target.difference(&current).cloned().collect();

        let mut statements = self.render_revokes(&to_revoke);
        statements.extend(self.render_grants(&to_grant));
        Ok(statements)
    }

    /// `state = "absent"`: revoke everything currently granted.
    fn plan_drop(&self, current: &StateMap) -> Vec<Statement> {
        self.render_revokes(&as_triples(current.get("privileges")))
    }
}

impl GrantsEntry {
    fn render_revokes(&self, triples: &BTreeSet<(String, String, bool)>) -> Vec<Statement> {
        // Grouped per object; the grant option dimension is irrelevant for
        // REVOKE, so privilege names are deduplicated within the group.
        let mut by_object: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (priv_name, object, _) in triples {
            by_object
                .entry(object.clone())
                .or_default()
                .insert(priv_name.clone());
        }

        by_object
            .into_iter()
            .map(|(object, privs)| {
                StatementBuilder::new(
                    StatementKind::Revoke,
                    format!(
                        "REVOKE {} ON {} FROM {}",
                        privs.iter().join(", "),
                        quote_grant_object(&object),
                        quote_identifier(&self.grantee)
                    ),
                )
                .build(self.cluster())
            })
            .collect()
    }

    fn render_grants(&self, triples: &BTreeSet<(String, String, bool)>) -> Vec<Statement> {
        let mut by_group: BTreeMap<(String, bool), BTreeSet<String>> = BTreeMap::new();
        for (priv_name, object, grant_option) in triples {
            by_group
                .entry((object.clone(), *grant_option))
                .or_default()
                .insert(priv_name.clone());
        }

        by_group
            .into_iter()
            .map(|((object, grant_option), privs)| {
                let suffix = if grant_option { " WITH GRANT OPTION" } else { "" };
                StatementBuilder::new(
                    StatementKind::Grant,
                    format!(
                        "GRANT {} ON {} TO {}{}",
                        privs.iter().join(", "),
                        quote_grant_object(&object),
                        quote_identifier(&self.grantee),
                        suffix
                    ),
                )
                .build(self.cluster())
            })
            .collect()
    }
}
