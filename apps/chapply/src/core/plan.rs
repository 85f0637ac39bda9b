//! # Statement planner
//!
//! Turns a computed diff into ordered DDL text. Backend grammar quirks live
//! here as explicit tables: clause ordering, per-statement-kind ON CLUSTER
//! placement, and quoting rules.

use serde::Serialize;

/// A planned DDL statement plus metadata about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    /// Password-free rendering for reports and logs; `sql` when no secret is
    /// embedded.
    pub display_sql: String,
    pub destructive: bool,
    pub cluster_qualified: bool,
}

impl Statement {
    pub fn display(&self) -> &str {
        &self.display_sql
    }
}

/// Every DDL form the planner can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    CreateDatabase,
    AlterDatabase,
    DropDatabase,
    RenameDatabase,
    CreateUser,
    AlterUser,
    DropUser,
    CreateRole,
    DropRole,
    Grant,
    Revoke,
    CreateQuota,
    AlterQuota,
    DropQuota,
}

/// Where the `ON CLUSTER` clause sits in a statement's grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPosition {
    /// Directly after the leading keyword: `GRANT ON CLUSTER c SELECT ...`.
    AfterVerb,
    /// After the entity name, before any attribute clauses:
    /// `CREATE DATABASE foo ON CLUSTER c ENGINE = Memory`.
    AfterName,
    /// After every other clause: `RENAME DATABASE a TO b ON CLUSTER c`.
    AtEnd,
}

/// The per-statement-kind placement table. The position differs between
/// statement kinds in ClickHouse's grammar, so it is encoded here once rather
/// than appended ad hoc at each call site.
pub fn cluster_position(kind: StatementKind) -> ClusterPosition {
    use StatementKind::*;
    match kind {
        CreateDatabase | AlterDatabase | DropDatabase => ClusterPosition::AfterName,
        RenameDatabase => ClusterPosition::AtEnd,
        CreateUser | AlterUser | DropUser => ClusterPosition::AfterName,
        CreateRole | DropRole => ClusterPosition::AfterName,
        Grant | Revoke => ClusterPosition::AfterVerb,
        CreateQuota | AlterQuota | DropQuota => ClusterPosition::AfterName,
    }
}

fn is_destructive(kind: StatementKind) -> bool {
    use StatementKind::*;
    matches!(kind, DropDatabase | DropUser | DropRole | DropQuota | Revoke)
}

/// Quotes an identifier with backticks, doubling embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Escapes a string for use in a SQL string literal: `\` -> `\\`, `'` -> `''`.
pub fn escape_string_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

/// Quotes a grant object like `db.table`, `db.*` or `*.*`, backtick-quoting
/// the named parts and leaving `*` wildcards bare.
pub fn quote_grant_object(object: &str) -> String {
    object
        .splitn(2, '.')
        .map(|part| {
            if part == "*" {
                "*".to_string()
            } else {
                quote_identifier(part)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Assembles one statement from a head (verb + entity name), ordered clauses,
/// and an optional cluster scope placed per the grammar table.
pub struct StatementBuilder {
    kind: StatementKind,
    head: String,
    clauses: Vec<String>,
    /// Clause index -> redacted replacement used in `display_sql`.
    redactions: Vec<(usize, String)>,
}

impl StatementBuilder {
    pub fn new(kind: StatementKind, head: impl Into<String>) -> Self {
        Self {
            kind,
            head: head.into(),
            clauses: Vec::new(),
            redactions: Vec::new(),
        }
    }

    pub fn clause(mut self, clause: impl Into<String>) -> Self {
        self.clauses.push(clause.into());
        self
    }

    pub fn clause_opt(self, clause: Option<String>) -> Self {
        match clause {
            Some(c) => self.clause(c),
            None => self,
        }
    }

    /// Adds a clause whose report/log rendering differs from the executed SQL
    /// (e.g. `IDENTIFIED WITH sha256_password BY '*****'`).
    pub fn secret_clause(mut self, clause: impl Into<String>, display: impl Into<String>) -> Self {
        self.redactions.push((self.clauses.len(), display.into()));
        self.clauses.push(clause.into());
        self
    }

    pub fn build(self, cluster: Option<&str>) -> Statement {
        let sql = self.render(cluster, false);
        let display_sql = if self.redactions.is_empty() {
            sql.clone()
        } else {
            self.render(cluster, true)
        };
        Statement {
            sql,
            display_sql,
            destructive: is_destructive(self.kind),
            cluster_qualified: cluster.is_some(),
        }
    }

    fn render(&self, cluster: Option<&str>, redacted: bool) -> String {
        let cluster_clause = cluster.map(|c| format!("ON CLUSTER {}", quote_identifier(c)));

        let mut parts: Vec<String> = Vec::with_capacity(self.clauses.len() + 2);
        match (cluster_position(self.kind), &cluster_clause) {
            (ClusterPosition::AfterVerb, Some(clause)) => {
                let (verb, rest) = self
                    .head
                    .split_once(' ')
                    .expect("statement head is always multi-word");
                parts.push(format!("{verb} {clause} {rest}"));
            }
            (ClusterPosition::AfterName, Some(clause)) => {
                parts.push(self.head.clone());
                parts.push(clause.clone());
            }
            _ => parts.push(self.head.clone()),
        }

        for (idx, clause) in self.clauses.iter().enumerate() {
            let rendered = if redacted {
                self.redactions
                    .iter()
                    .find(|(i, _)| *i == idx)
                    .map(|(_, display)| display)
                    .unwrap_or(clause)
            } else {
                clause
            };
            parts.push(rendered.clone());
        }

        if let (ClusterPosition::AtEnd, Some(clause)) = (cluster_position(self.kind), &cluster_clause)
        {
            parts.push(clause.clone());
        }

        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes_backticks() {
        assert_eq!(quote_identifier("plain"), "`plain`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal("it's"), "it''s");
        assert_eq!(escape_string_literal(r"a\b"), r"a\\b");
    }

    #[test]
    fn test_quote_grant_object() {
        assert_eq!(quote_grant_object("*.*"), "*.*");
        assert_eq!(quote_grant_object("db.*"), "`db`.*");
        assert_eq!(quote_grant_object("db.table"), "`db`.`table`");
    }

    #[test]
    fn test_cluster_after_name_for_create() {
        let stmt = StatementBuilder::new(
            StatementKind::CreateDatabase,
            format!("CREATE DATABASE {}", quote_identifier("foo")),
        )
        .clause("ENGINE = Memory")
        .build(Some("c1"));
        assert_eq!(stmt.sql, "CREATE DATABASE `foo` ON CLUSTER `c1` ENGINE = Memory");
        assert!(stmt.cluster_qualified);
        assert!(!stmt.destructive);
    }

    #[test]
    fn test_cluster_after_verb_for_grant() {
        let stmt = StatementBuilder::new(
            StatementKind::Grant,
            "GRANT SELECT ON `db`.* TO `alice`".to_string(),
        )
        .build(Some("c1"));
        assert_eq!(stmt.sql, "GRANT ON CLUSTER `c1` SELECT ON `db`.* TO `alice`");
    }

    #[test]
    fn test_cluster_at_end_for_rename() {
        let stmt = StatementBuilder::new(
            StatementKind::RenameDatabase,
            "RENAME DATABASE `a` TO `b`".to_string(),
        )
        .build(Some("c1"));
        assert_eq!(stmt.sql, "RENAME DATABASE `a` TO `b` ON CLUSTER `c1`");
    }

    #[test]
    fn test_cluster_positions_differ_between_create_and_grant() {
        assert_ne!(
            cluster_position(StatementKind::CreateDatabase),
            cluster_position(StatementKind::Grant),
        );
        assert_ne!(
            cluster_position(StatementKind::CreateDatabase),
            cluster_position(StatementKind::RenameDatabase),
        );
    }

    #[test]
    fn test_no_cluster_scope_emits_no_clause() {
        let stmt = StatementBuilder::new(
            StatementKind::DropUser,
            "DROP USER `alice`".to_string(),
        )
        .build(None);
        assert_eq!(stmt.sql, "DROP USER `alice`");
        assert!(!stmt.cluster_qualified);
        assert!(stmt.destructive);
    }

    #[test]
    fn test_secret_clause_redacts_display_only() {
        let stmt = StatementBuilder::new(
            StatementKind::CreateUser,
            "CREATE USER `alice`".to_string(),
        )
        .secret_clause(
            "IDENTIFIED WITH sha256_password BY 'qwerty'",
            "IDENTIFIED WITH sha256_password BY '*****'",
        )
        .build(None);
        assert!(stmt.sql.contains("qwerty"));
        assert!(!stmt.display_sql.contains("qwerty"));
        assert!(stmt.display_sql.contains("'*****'"));
    }
}
