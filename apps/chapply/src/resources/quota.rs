//! Quotas. Current state is recovered by parsing `SHOW CREATE QUOTA` output;
//! desired and observed definitions are normalized to the same canonical
//! clause strings before comparison (limits sorted, no-limits intervals
//! dropped, `all_except_listed` with an empty list collapsed to `all`), so
//! cosmetic differences in the server's rendering never register as drift.
//!
//! CREATE and ALTER both carry the full definition in one statement; the
//! backend does not take quota clauses piecemeal.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use itertools::Itertools;
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

/// Canonical attribute order for quota definitions.
static QUOTA_ATTRIBUTES: &[AttributeSpec] = &[
    AttributeSpec {
        name: "keyed_by",
        policy: MergePolicy::Replace,
        mutability: Mutability::Mutable,
    },
    AttributeSpec {
        name: "limits",
        policy: MergePolicy::SetReplace,
        mutability: Mutability::Mutable,
    },
    AttributeSpec {
        name: "apply_to_mode",
        policy: MergePolicy::Replace,
        mutability: Mutability::Mutable,
    },
    AttributeSpec {
        name: "apply_to",
        policy: MergePolicy::SetReplace,
        mutability: Mutability::Mutable,
    },
];

pub static QUOTA_DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    kind: ResourceKind::Quota,
    attributes: QUOTA_ATTRIBUTES,
};

const INTERVAL_UNITS: &[&str] = &[
    "second", "minute", "hour", "day", "week", "month", "quarter", "year",
];

const MAX_LIMIT_TYPES: &[&str] = &[
    "queries",
    "query_selects",
    "query_inserts",
    "errors",
    "result_rows",
    "result_bytes",
    "read_rows",
    "read_bytes",
    "written_bytes",
    "execution_time",
    "failed_sequential_authentications",
];

const KEYED_BY_VALUES: &[&str] = &[
    "user_name",
    "ip_address",
    "client_key,user_name",
    "client_key,ip_address",
    "client_key",
];

static CREATE_QUOTA_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^CREATE QUOTA (?:`[^`]+`|[0-9A-Za-z_]+)(?: ON CLUSTER (?:`[^`]+`|[0-9A-Za-z_]+))?(?: KEYED BY (?P<keyed_by>user_name|ip_address|client_key, ?user_name|client_key, ?ip_address|client_key))?",
    )
    .expect("hardcoded regex is valid")
});

static LIMIT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"FOR (?:(?P<randomized>RANDOMIZED) )?INTERVAL (?P<number>-?\d+\.?\d*) (?P<unit>second|minute|hour|day|week|month|quarter|year) (?P<limit>MAX(?:,? [a-z_]+ = -?\d+\.?\d*)+|NO LIMITS|TRACKING ONLY)",
    )
    .expect("hardcoded regex is valid")
});

static APPLY_TO_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" TO (?P<apply_to>ALL EXCEPT [^=]+|ALL|[^=]+)$").expect("hardcoded regex is valid")
});

/// Which principals a quota applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyToMode {
    #[default]
    ListedOnly,
    All,
    AllExceptListed,
}

impl ApplyToMode {
    fn as_str(&self) -> &'static str {
        match self {
            ApplyToMode::ListedOnly => "listed_only",
            ApplyToMode::All => "all",
            ApplyToMode::AllExceptListed => "all_except_listed",
        }
    }
}

/// One quota interval. Exactly one of `max`, `no_limits`, `tracking_only`
/// must be given.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaLimit {
    /// e.g. `"5 minute"`.
    pub interval: String,
    #[serde(default)]
    pub randomized_start: bool,
    #[serde(default)]
    pub max: BTreeMap<String, f64>,
    #[serde(default)]
    pub no_limits: bool,
    #[serde(default)]
    pub tracking_only: bool,
}

/// One `[[quotas]]` entry from the state file.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaEntry {
    pub name: String,
    #[serde(default)]
    pub keyed_by: Option<String>,
    #[serde(default)]
    pub limits: Vec<QuotaLimit>,
    #[serde(default)]
    pub apply_to: Vec<String>,
    #[serde(default)]
    pub apply_to_mode: ApplyToMode,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub state: EntryState,
}

impl QuotaEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("quota name cannot be empty".to_string());
        }
        if self.state == EntryState::Rename {
            return Err("quotas cannot be renamed".to_string());
        }
        if let Some(keyed_by) = &self.keyed_by {
            if !KEYED_BY_VALUES.contains(&canonical_keyed_by(keyed_by).as_str()) {
                return Err(format!(
                    "'{keyed_by}' is not a valid quota key (one of: {})",
                    KEYED_BY_VALUES.iter().join(", ")
                ));
            }
        }
        for limit in &self.limits {
            let (number, unit) = limit
                .interval
                .split_once(' ')
                .ok_or_else(|| format!("'{}' is not a valid interval", limit.interval))?;
            if number.parse::<f64>().map(|n| n <= 0.0).unwrap_or(true) {
                return Err(format!("'{}' is not a valid interval length", number));
            }
            if !INTERVAL_UNITS.contains(&unit) {
                return Err(format!(
                    "'{unit}' is not a valid interval unit (one of: {})",
                    INTERVAL_UNITS.iter().join(", ")
                ));
            }
            let modes = [!limit.max.is_empty(), limit.no_limits, limit.tracking_only];
            if modes.iter().filter(|m| **m).count() != 1 {
                return Err(format!(
                    "interval '{}' needs exactly one of max, no_limits or tracking_only",
                    limit.interval
                ));
            }
            for key in limit.max.keys() {
                if !MAX_LIMIT_TYPES.contains(&key.as_str()) {
                    return Err(format!("'{key}' is not a valid quota limit type"));
                }
            }
        }
        if !self.apply_to.is_empty() && self.apply_to_mode == ApplyToMode::All {
            return Err("apply_to cannot be combined with apply_to_mode = \"all\"".to_string());
        }
        if self.apply_to.iter().any(|n| n.is_empty()) {
            return Err("apply_to names cannot be empty".to_string());
        }
        Ok(())
    }
}

fn canonical_keyed_by(keyed_by: &str) -> String {
    keyed_by.split(',').map(str::trim).join(",")
}

/// Numbers print without a trailing `.0` so that `100` and `100.0` compare
/// equal between the state file and the server's rendering.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Renders one interval as its canonical clause string. The same string is
/// used for comparison and as the literal SQL clause.
fn render_limit_clause(
    randomized: bool,
    interval_number: &str,
    interval_unit: &str,
    max: &BTreeMap<String, f64>,
    tracking_only: bool,
) -> String {
    let mut clause = String::from("FOR ");
    if randomized {
        clause.push_str("RANDOMIZED ");
    }
    let number = interval_number
        .parse::<f64>()
        .map(format_number)
        .unwrap_or_else(|_| interval_number.to_string());
    clause.push_str(&format!("INTERVAL {number} {interval_unit} "));
    if tracking_only {
        clause.push_str("TRACKING ONLY");
    } else {
        clause.push_str("MAX ");
        clause.push_str(
            &max.iter()
                .map(|(key, value)| format!("{key} = {}", format_number(*value)))
                .join(", "),
        );
    }
    clause
}

/// Parses the server's `CREATE QUOTA ...` rendering into the same canonical
/// state map shape `desired` produces.
fn parse_create_quota(create_statement: &str) -> Result<StateMap, String> {
    let captures = CREATE_QUOTA_LINE
        .captures(create_statement)
        .ok_or_else(|| format!("could not parse '{create_statement}'"))?;

    let mut map = StateMap::new();
    let keyed_by = captures
        .name("keyed_by")
        .map(|m| canonical_keyed_by(m.as_str()))
        .unwrap_or_default();
    map.insert("keyed_by".to_string(), AttrValue::Str(keyed_by));

    let mut limits = std::collections::BTreeSet::new();
    for limit in LIMIT_CLAUSE.captures_iter(create_statement) {
        let limit_text = &limit["limit"];
        if limit_text == "NO LIMITS" {
            // server default, dropped from the canonical form
            continue;
        }
        let mut max = BTreeMap::new();
        let tracking_only = limit_text == "TRACKING ONLY";
        if !tracking_only {
            for part in limit_text["MAX ".len()..].split(", ") {
                let Some((key, value)) = part.split_once(" = ") else {
                    return Err(format!("could not parse quota limit '{part}'"));
                };
                let value: f64 = value
                    .parse()
                    .map_err(|_| format!("could not parse quota limit value '{value}'"))?;
                max.insert(key.trim().trim_start_matches(',').to_string(), value);
            }
        }
        limits.insert(render_limit_clause(
            limit.name("randomized").is_some(),
            &limit["number"],
            &limit["unit"],
            &max,
            tracking_only,
        ));
    }
    map.insert("limits".to_string(), AttrValue::StrSet(limits));

    let mut apply_to_mode = "listed_only";
    let mut apply_to = Vec::new();
    if let Some(captures) = APPLY_TO_CLAUSE.captures(create_statement) {
        let target = captures["apply_to"].trim();
        let names = if target == "ALL" {
            apply_to_mode = "all";
            ""
        } else if let Some(rest) = target.strip_prefix("ALL EXCEPT ") {
            apply_to_mode = "all_except_listed";
            rest
        } else {
            target
        };
        apply_to = names
            .split(',')
            .map(|n| n.trim().trim_matches('`').to_string())
            .filter(|n| !n.is_empty())
            .collect();
    }
    map.insert(
        "apply_to_mode".to_string(),
        AttrValue::Str(apply_to_mode.to_string()),
    );
    map.insert("apply_to".to_string(), AttrValue::str_set(apply_to));
    Ok(map)
}

fn set_attr(map: &StateMap, name: &str) -> Vec<String> {
    match map.get(name) {
        Some(AttrValue::StrSet(s)) => s.iter().cloned().collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Resource for QuotaEntry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Quota
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
        &QUOTA_DESCRIPTOR
    }

    fn desired(&self, version: Option<&ServerVersion>) -> (StateMap, Vec<String>) {
        let mut map = StateMap::new();
        let mut warnings = Vec::new();

        map.insert(
            "keyed_by".to_string(),
            AttrValue::Str(
                self.keyed_by
                    .as_deref()
                    .map(canonical_keyed_by)
                    .unwrap_or_default(),
            ),
        );

        let mut limits = std::collections::BTreeSet::new();
        for limit in &self.limits {
            if limit.no_limits {
                // server default, dropped from the canonical form
                continue;
            }
            let mut max = limit.max.clone();
            if let Some(v) = version {
                if !v.supports_failed_auth_quota()
                    && max.remove("failed_sequential_authentications").is_some()
                {
                    warnings.push(format!(
                        "failed_sequential_authentications is not supported by server \
                         version {}; ignoring it for quota '{}'",
                        v.raw, self.name
                    ));
                    if max.is_empty() && !limit.tracking_only {
                        continue;
                    }
                }
            }
            let Some((number, unit)) = limit.interval.split_once(' ') else {
                continue;
            };
            limits.insert(render_limit_clause(
                limit.randomized_start,
                number,
                unit,
                &max,
                limit.tracking_only,
            ));
        }
        map.insert("limits".to_string(), AttrValue::StrSet(limits));

        let mode = if self.apply_to_mode == ApplyToMode::AllExceptListed && self.apply_to.is_empty()
        {
            ApplyToMode::All
        } else {
            self.apply_to_mode
        };
        map.insert(
            "apply_to_mode".to_string(),
            AttrValue::Str(mode.as_str().to_string()),
        );
        map.insert(
            "apply_to".to_string(),
            AttrValue::str_set(self.apply_to.clone()),
        );

        (map, warnings)
    }

    async fn read(
        &self,
        runner: &dyn StatementRunner,
        _version: Option<&ServerVersion>,
        name: &str,
    ) -> Result<ObservedState, ReconcileError> {
        let sql = format!(
            "SELECT 1 FROM system.quotas WHERE name = '{}' LIMIT 1",
            escape_string_literal(name)
        );
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        if rows.is_empty() {
            return Ok(ObservedState::NotFound);
        }

        let sql = format!("SHOW CREATE QUOTA '{}'", escape_string_literal(name));
        let rows = runner.run(&sql).await.map_err(ReconcileError::Clickhouse)?;
        let create_statement = rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| ReconcileError::InvalidDefinition {
                kind: ResourceKind::Quota,
                name: name.to_string(),
                message: "SHOW CREATE QUOTA returned no rows".to_string(),
            })?;

        let map = parse_create_quota(create_statement).map_err(|message| {
            ReconcileError::InvalidDefinition {
                kind: ResourceKind::Quota,
                name: name.to_string(),
                message,
            }
        })?;
        Ok(ObservedState::Present(map))
    }

    fn plan_create(&self, desired: &StateMap) -> Result<Vec<Statement>, ReconcileError> {
        Ok(vec![self.render_statement(
            StatementKind::CreateQuota,
            "CREATE",
            desired,
        )])
    }

    fn plan_alter(
        &self,
        desired: &StateMap,
        _diff: &Diff,
    ) -> Result<Vec<Statement>, ReconcileError> {
        Ok(vec![self.render_statement(
            StatementKind::AlterQuota,
            "ALTER",
            desired,
        )])
    }

    fn plan_drop(&self, _current: &StateMap) -> Vec<Statement> {
        vec![StatementBuilder::new(
            StatementKind::DropQuota,
            format!("DROP QUOTA {}", quote_identifier(&self.name)),
        )
        .build(self.cluster())]
    }
}

impl QuotaEntry {
    /// One statement carrying every clause, in canonical order: KEYED BY,
    /// interval limits, TO.
    fn render_statement(&self, kind: StatementKind, verb: &str, desired: &StateMap) -> Statement {
        let mut builder = StatementBuilder::new(
            kind,
            format!("{verb} QUOTA {}", quote_identifier(&self.name)),
        );

        match str_attr(desired, "keyed_by").filter(|k| !k.is_empty()) {
            Some(keyed_by) => {
                builder = builder.clause(format!(
                    "KEYED BY {}",
                    keyed_by.split(',').join(", ")
                ));
            }
            // un-keying has to be explicit on ALTER or the old key survives
            None if kind == StatementKind::AlterQuota => {
                builder = builder.clause("NOT KEYED");
            }
            None => {}
        }

        let limits = set_attr(desired, "limits");
        if !limits.is_empty() {
            builder = builder.clause(limits.join(", "));
        }

        let apply_to = set_attr(desired, "apply_to");
        let mode = str_attr(desired, "apply_to_mode").unwrap_or_default();
        match mode.as_str() {
            "all" => builder = builder.clause("TO ALL"),
            "all_except_listed" => {
                builder = builder.clause(format!(
                    "TO ALL EXCEPT {}",
                    apply_to.iter().map(|n| quote_identifier(n)).join(", ")
                ));
            }
            _ if !apply_to.is_empty() => {
                builder = builder.clause(format!(
                    "TO {}",
                    apply_to.iter().map(|n| quote_identifier(n)).join(", ")
                ));
            }
            _ => {}
        }

        builder.build(self.cluster())
    }
}
