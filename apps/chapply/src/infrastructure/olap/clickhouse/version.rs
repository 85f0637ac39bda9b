//! Server version parsing and feature gates.
//!
//! ClickHouse versions are four-part (`year.feature.maintenance.build`),
//! which semver cannot represent. Feature availability is gated on the year
//! component; a desired attribute the target cannot express is skipped with
//! a warning rather than sent and rejected.

use super::errors::ClickhouseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub raw: String,
    pub year: u32,
    pub feature: u32,
    pub maintenance: u32,
    pub build: u32,
    /// Release channel suffix when present, e.g. `stable` in `24.1.2.3-stable`.
    pub channel: Option<String>,
}

impl ServerVersion {
    /// Parses the output of `SELECT version()`, e.g. `24.1.2.3` or
    /// `23.8.9.54-lts`.
    pub fn parse(raw: &str) -> Result<Self, ClickhouseError> {
        let malformed = || ClickhouseError::MalformedResponse {
            message: format!("unparsable server version '{raw}'"),
        };

        let mut parts = raw.trim().splitn(4, '.');
        let year = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let feature = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let maintenance = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;

        let last = parts.next().ok_or_else(malformed)?;
        let (build, channel) = match last.split_once('-') {
            Some((build, channel)) => (
                build.parse().map_err(|_| malformed())?,
                Some(channel.to_string()),
            ),
            None => (last.parse().map_err(|_| malformed())?, None),
        };

        Ok(Self {
            raw: raw.trim().to_string(),
            year,
            feature,
            maintenance,
            build,
            channel,
        })
    }

    /// Database and role comments landed in 22.x.
    pub fn supports_entity_comments(&self) -> bool {
        self.year >= 22
    }

    /// The `failed_sequential_authentications` quota limit landed in 23.x.
    pub fn supports_failed_auth_quota(&self) -> bool {
        self.year >= 23
    }
}
