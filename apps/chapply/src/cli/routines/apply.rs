//! The `apply` and `plan` subcommands: load a state file, reconcile every
//! declared resource against the target server, and report what changed.

use std::path::Path;

use tracing::warn;

use crate::cli::display::Message;
use crate::cli::routines::{RoutineFailure, RoutineSuccess};
use crate::cli::settings::Settings;
use crate::cli::show_report;
use crate::core::reconcile::reconcile_all;
use crate::infrastructure::olap::clickhouse::config::parse_clickhouse_connection_string;
use crate::infrastructure::olap::clickhouse::ClickHouseClient;
use crate::statefile::StateFile;

pub struct ApplyArgs<'a> {
    pub file: &'a Path,
    pub check: bool,
    pub url: Option<&'a str>,
    pub cluster: Option<&'a str>,
    pub json: bool,
}

/// Resolves the connection URL in precedence order: the `--url` flag, the
/// state file's `[connection]` table, then the user settings fallback.
fn resolve_url(
    flag: Option<&str>,
    state: &StateFile,
    settings: &Settings,
) -> Result<String, RoutineFailure> {
    flag.map(String::from)
        .or_else(|| state.connection.url.clone())
        .or_else(|| settings.clickhouse_url.clone())
        .ok_or_else(|| {
            RoutineFailure::error(Message {
                action: "Connect".to_string(),
                details: "no connection URL; pass --url, add a [connection] table to the \
                          state file, or set clickhouse_url in ~/.chapply/config.toml"
                    .to_string(),
            })
        })
}

pub async fn apply_state(
    settings: &Settings,
    args: ApplyArgs<'_>,
) -> Result<RoutineSuccess, RoutineFailure> {
    let mut state = StateFile::load(args.file).map_err(|e| {
        RoutineFailure::new(
            Message {
                action: "Load".to_string(),
                details: format!("invalid state file {}", args.file.display()),
            },
            e,
        )
    })?;

    if let Some(cluster) = args.cluster {
        state.apply_default_cluster(cluster);
    }

    let url = resolve_url(args.url, &state, settings)?;
    let config = parse_clickhouse_connection_string(&url).map_err(|e| {
        RoutineFailure::new(
            Message {
                action: "Connect".to_string(),
                details: "could not parse the connection URL".to_string(),
            },
            e,
        )
    })?;

    let client = ClickHouseClient::new(&config).map_err(|e| {
        RoutineFailure::new(
            Message {
                action: "Connect".to_string(),
                details: config.display_url(),
            },
            e,
        )
    })?;

    client.ping().await.map_err(|e| {
        RoutineFailure::new(
            Message {
                action: "Connect".to_string(),
                details: format!("{} is unreachable", config.display_url()),
            },
            e,
        )
    })?;

    // Version gating degrades gracefully when the probe fails: every
    // version-dependent attribute is then assumed supported.
    let version = match client.server_version().await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("could not determine server version: {e}");
            None
        }
    };

    let resources = state.resources();
    let report = reconcile_all(&client, version.as_ref(), &resources, args.check).await;

    if args.json {
        let rendered = serde_json::to_string_pretty(&report).map_err(|e| {
            RoutineFailure::new(
                Message {
                    action: "Report".to_string(),
                    details: "failed to serialize the run report".to_string(),
                },
                e,
            )
        })?;
        println!("{rendered}");

        // The JSON document is the whole output; suppress the trailing
        // status line in both directions.
        return if report.failed {
            Err(RoutineFailure::error(Message::new(
                String::new(),
                String::new(),
            )))
        } else {
            Ok(RoutineSuccess::success(Message::new(
                String::new(),
                String::new(),
            )))
        };
    }

    show_report(&report);

    let action = if args.check { "Plan" } else { "Apply" };
    if report.failed {
        let details = report
            .error_message
            .clone()
            .unwrap_or_else(|| "one or more resources failed to reconcile".to_string());
        return Err(RoutineFailure::error(Message::new(
            action.to_string(),
            details,
        )));
    }

    let details = if args.check {
        format!(
            "{} resource(s), {} statement(s) pending",
            report.results.len(),
            report.executed_statements.len(),
        )
    } else {
        format!(
            "{} resource(s), {} statement(s) executed",
            report.results.len(),
            report.executed_statements.len(),
        )
    };
    Ok(RoutineSuccess::success(Message::new(
        action.to_string(),
        details,
    )))
}
