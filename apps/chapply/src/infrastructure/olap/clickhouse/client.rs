use base64::prelude::*;
use http_body_util::BodyExt;
use http_body_util::Full;

use async_recursion::async_recursion;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use tokio::time::{sleep, Duration};
use tracing::{debug, error};

use super::config::ClickHouseConfig;
use super::errors::ClickhouseError;
use super::version::ServerVersion;
use crate::core::execute::StatementRunner;

pub struct ClickHouseClient {
    client: Client<HttpConnector, Full<Bytes>>,
    ssl_client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    config: ClickHouseConfig,
}

// The server could take a while to wake up, so retry connects with backoff
const BACKOFF_START_MILLIS: u64 = 500;
const MAX_RETRIES: u8 = 5;
// Retries will be 0.5s, 1s, 2s, 4s, 8s

impl ClickHouseClient {
    pub fn new(clickhouse_config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client_builder = Client::builder(hyper_util::rt::TokioExecutor::new());

        let https = HttpsConnector::new();
        let http = HttpConnector::new();

        Ok(Self {
            client: client_builder.build(http),
            ssl_client: client_builder.build(https),
            config: clickhouse_config.clone(),
        })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    #[async_recursion]
    async fn request(
        &self,
        req: Request<Full<Bytes>>,
        retries: u8,
        backoff_millis: u64,
    ) -> Result<Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
        let res = if self.config.use_ssl {
            self.ssl_client.request(req.clone()).await
        } else {
            self.client.request(req.clone()).await
        };

        match res {
            Ok(res) => Ok(res),
            Err(e) => {
                if e.is_connect() && retries > 0 {
                    sleep(Duration::from_millis(backoff_millis)).await;
                    self.request(req, retries - 1, backoff_millis * 2).await
                } else {
                    Err(e)
                }
            }
        }
    }

    fn auth_header(&self) -> String {
        let username_and_password = format!("{}:{}", self.config.user, self.config.password);
        let encoded = BASE64_STANDARD.encode(username_and_password);
        format!("Basic {encoded}")
    }

    fn host(&self) -> String {
        format!("{}:{}", self.config.host, self.config.host_port)
    }

    fn uri(&self, path: String) -> Result<Uri, ClickhouseError> {
        let scheme = if self.config.use_ssl { "https" } else { "http" };

        let uri = format!("{}://{}{}", scheme, self.host(), path);
        uri.parse().map_err(|e| ClickhouseError::BackendUnavailable {
            message: format!("invalid request URI: {e}"),
        })
    }

    pub async fn ping(&self) -> Result<(), ClickhouseError> {
        let req = Request::builder()
            .method("GET")
            .uri(self.uri("/ping".to_string())?)
            .header("Host", self.host())
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClickhouseError::BackendUnavailable {
                message: e.to_string(),
            })?;

        let res = self
            .request(req, MAX_RETRIES, BACKOFF_START_MILLIS)
            .await
            .map_err(|e| ClickhouseError::BackendUnavailable {
                message: e.to_string(),
            })?;

        if res.status() != 200 {
            return Err(ClickhouseError::BackendUnavailable {
                message: format!("ping returned status {}", res.status()),
            });
        }
        Ok(())
    }

    /// Executes a statement and returns the response rows (TabSeparated).
    ///
    /// DDL and other data-modifying statements carry `wait_end_of_query=1` so
    /// the 200 status reflects completed execution rather than accepted input.
    pub async fn execute_sql(&self, sql: &str) -> Result<Vec<Vec<String>>, ClickhouseError> {
        let query = query_param(sql, &self.config.db_name)?;
        let uri = self.uri(format!("/?{query}"))?;
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Host", self.host())
            .header("Authorization", self.auth_header())
            .header("Content-Length", 0)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClickhouseError::BackendUnavailable {
                message: e.to_string(),
            })?;

        let res = self
            .request(req, MAX_RETRIES, BACKOFF_START_MILLIS)
            .await
            .map_err(|e| ClickhouseError::BackendUnavailable {
                message: e.to_string(),
            })?;

        let status = res.status();
        let body = res
            .collect()
            .await
            .map_err(|e| ClickhouseError::MalformedResponse {
                message: e.to_string(),
            })?
            .to_bytes()
            .to_vec();
        let body_str =
            String::from_utf8(body).map_err(|e| ClickhouseError::MalformedResponse {
                message: e.to_string(),
            })?;

        if status != 200 {
            error!("Statement failed with status {}: {}", status, body_str.trim());
            return Err(ClickhouseError::from_response_body(sql, &body_str));
        }

        debug!("Statement executed successfully: {}", sql);
        Ok(parse_tab_separated(&body_str))
    }

    /// Reads and parses `SELECT version()` from the target.
    pub async fn server_version(&self) -> Result<ServerVersion, ClickhouseError> {
        let rows = self.execute_sql("SELECT version()").await?;
        let raw = rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| ClickhouseError::MalformedResponse {
                message: "empty response to SELECT version()".to_string(),
            })?;
        ServerVersion::parse(raw)
    }
}

#[async_trait]
impl StatementRunner for ClickHouseClient {
    async fn run(&self, sql: &str) -> Result<Vec<Vec<String>>, ClickhouseError> {
        self.execute_sql(sql).await
    }
}

const DDL_COMMANDS: &[&str] = &[
    "CREATE", "ALTER", "DROP", "RENAME", "GRANT", "REVOKE", "TRUNCATE", "INSERT",
];

fn query_param(query: &str, database: &str) -> Result<String, ClickhouseError> {
    let mut params = vec![("query", query), ("database", database)];

    // Only add wait_end_of_query for data-modifying statements; buffering
    // SELECT responses costs read performance for nothing.
    let query_upper = query.trim().to_uppercase();
    if DDL_COMMANDS.iter().any(|cmd| query_upper.starts_with(cmd)) {
        params.push(("wait_end_of_query", "1"));
    }

    serde_urlencoded::to_string(&params).map_err(|e| ClickhouseError::MalformedResponse {
        message: e.to_string(),
    })
}

/// Parses a TabSeparated response body into rows of unescaped column values.
fn parse_tab_separated(body: &str) -> Vec<Vec<String>> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(unescape_tsv).collect())
        .collect()
}

/// Reverses ClickHouse TabSeparated escaping (`\t`, `\n`, `\r`, `\\`, `\'`).
fn unescape_tsv(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
