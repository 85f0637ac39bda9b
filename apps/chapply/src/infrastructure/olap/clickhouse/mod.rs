//! # ClickHouse backend
//!
//! Transport and introspection against the target server's HTTP interface.
//! Everything above this module speaks in statements and rows; this module
//! owns connections, authentication, retries, and response parsing.

pub mod client;
pub mod config;
pub mod errors;
pub mod version;

pub use client::ClickHouseClient;
pub use config::ClickHouseConfig;
pub use errors::ClickhouseError;
pub use version::ServerVersion;
