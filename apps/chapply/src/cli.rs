//! Command line interface for chapply.
//!
//! `main` parses the [`Cli`] struct and hands the chosen subcommand to
//! [`top_command_handler`], which dispatches to the routines module. All
//! user-visible output flows through the display module so human and
//! `--json` renderings stay separated.

#[macro_use]
pub mod display;
pub mod commands;
pub mod logger;
pub mod routines;
pub mod settings;

use clap::Parser;

use commands::Commands;
use display::{Message, MessageType};
use routines::apply::{apply_state, ApplyArgs};
use routines::ping::ping_server;
use routines::{RoutineFailure, RoutineSuccess};
use settings::Settings;

use crate::core::reconcile::RunReport;

#[derive(Parser)]
#[command(author, version, about, long_about = None, arg_required_else_help(true))]
pub struct Cli {
    /// Print backtraces for all errors (same as RUST_LIB_BACKTRACE=1)
    #[arg(long, global = true)]
    pub backtrace: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Human rendering of a run report: one line per resource, indented
/// statements, warnings to stderr.
pub fn show_report(report: &RunReport) {
    for entry in &report.results {
        let status = if entry.result.failed {
            "failed".to_string()
        } else if entry.result.changed {
            let n = entry.result.executed_statements.len();
            format!("changed ({n} statement{})", if n == 1 { "" } else { "s" })
        } else {
            "unchanged".to_string()
        };

        show_message!(
            MessageType::Info,
            Message {
                action: format!("{} '{}'", entry.kind, entry.name),
                details: status,
            }
        );

        for statement in &entry.result.executed_statements {
            println!("    {statement}");
        }

        for warning in &entry.result.warnings {
            show_message!(
                MessageType::Warning,
                Message {
                    action: "Warning".to_string(),
                    details: warning.clone(),
                }
            );
        }
    }
}

pub async fn top_command_handler(
    settings: Settings,
    commands: &Commands,
) -> Result<RoutineSuccess, RoutineFailure> {
    match commands {
        Commands::Apply {
            file,
            check,
            url,
            cluster,
            json,
        } => {
            apply_state(
                &settings,
                ApplyArgs {
                    file,
                    check: *check,
                    url: url.as_deref(),
                    cluster: cluster.as_deref(),
                    json: *json,
                },
            )
            .await
        }
        Commands::Plan {
            file,
            url,
            cluster,
            json,
        } => {
            apply_state(
                &settings,
                ApplyArgs {
                    file,
                    check: true,
                    url: url.as_deref(),
                    cluster: cluster.as_deref(),
                    json: *json,
                },
            )
            .await
        }
        Commands::Ping { url } => ping_server(&settings, url.as_deref()).await,
    }
}
