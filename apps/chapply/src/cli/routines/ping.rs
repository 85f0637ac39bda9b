//! The `ping` subcommand: verify connectivity and report the server version.

use crate::cli::display::Message;
use crate::cli::routines::{RoutineFailure, RoutineSuccess};
use crate::cli::settings::Settings;
use crate::infrastructure::olap::clickhouse::config::parse_clickhouse_connection_string;
use crate::infrastructure::olap::clickhouse::ClickHouseClient;

pub async fn ping_server(
    settings: &Settings,
    url: Option<&str>,
) -> Result<RoutineSuccess, RoutineFailure> {
    let url = url
        .map(String::from)
        .or_else(|| settings.clickhouse_url.clone())
        .ok_or_else(|| {
            RoutineFailure::error(Message {
                action: "Connect".to_string(),
                details: "no connection URL; pass --url or set clickhouse_url in \
                          ~/.chapply/config.toml"
                    .to_string(),
            })
        })?;

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
                action: "Ping".to_string(),
                details: format!("{} is unreachable", config.display_url()),
            },
            e,
        )
    })?;

    let details = match client.server_version().await {
        Ok(version) => format!("{} (version {})", config.display_url(), version.raw),
        Err(_) => config.display_url(),
    };

    Ok(RoutineSuccess::success(Message::new(
        "Ping".to_string(),
        details,
    )))
}
