/// ClickHouse exception code for "Not enough privileges".
pub const ACCESS_DENIED_CODE: u32 = 497;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClickhouseError {
    /// The server could not be reached at all. Fatal: nothing has been
    /// executed when this is raised.
    #[error("ClickHouse - server unavailable: {message}")]
    BackendUnavailable { message: String },

    /// The server rejected a catalog query or a statement for lack of
    /// privileges. Read paths recover from this locally; write paths do not.
    #[error("ClickHouse - not enough privileges: {message}")]
    InsufficientPrivilege { message: String },

    /// The server rejected a planned statement. The statement loop stops here.
    #[error("ClickHouse - statement failed: {message}")]
    StatementExecutionFailure { statement: String, message: String },

    #[error("ClickHouse - invalid {identifier_type}: '{name}' - {reason}")]
    InvalidIdentifier {
        identifier_type: String,
        name: String,
        reason: String,
    },

    #[error("ClickHouse - malformed response: {message}")]
    MalformedResponse { message: String },
}

impl ClickhouseError {
    /// Classifies an HTTP error body from the server. ClickHouse reports its
    /// exception code in the body text, e.g.
    /// `Code: 497. DB::Exception: ...: Not enough privileges. (ACCESS_DENIED)`.
    pub fn from_response_body(statement: &str, body: &str) -> Self {
        if body.contains("Not enough privileges")
            || body.contains("ACCESS_DENIED")
            || body.contains(&format!("Code: {ACCESS_DENIED_CODE}"))
        {
            ClickhouseError::InsufficientPrivilege {
                message: body.trim().to_string(),
            }
        } else {
            ClickhouseError::StatementExecutionFailure {
                statement: statement.to_string(),
                message: body.trim().to_string(),
            }
        }
    }

    pub fn is_privilege_denied(&self) -> bool {
        matches!(self, ClickhouseError::InsufficientPrivilege { .. })
    }
}

/// Checks if a string is a valid ClickHouse identifier.
///
/// Identifiers (database names, cluster names, etc.) must:
/// - Be non-empty
/// - Contain only alphanumeric characters and underscores
/// - Not start with a digit
///
/// Names outside this set are still usable but must go through backtick
/// quoting (see `core::plan::quote_identifier`).
pub fn is_valid_clickhouse_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap().is_ascii_digit()
}

/// Validates that a string is a valid ClickHouse identifier, returning a
/// typed error on failure.
pub fn validate_clickhouse_identifier(
    name: &str,
    identifier_type: &str,
) -> Result<(), ClickhouseError> {
    if is_valid_clickhouse_identifier(name) {
        return Ok(());
    }

    let reason = if name.is_empty() {
        "cannot be empty"
    } else if name.chars().next().unwrap().is_ascii_digit() {
        "cannot start with a digit"
    } else {
        "contains invalid characters (only alphanumeric and underscore allowed)"
    };

    Err(ClickhouseError::InvalidIdentifier {
        identifier_type: identifier_type.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_clickhouse_identifier("test_db", "Database").is_ok());
        assert!(validate_clickhouse_identifier("Role123", "Role").is_ok());
        assert!(validate_clickhouse_identifier("_private", "User").is_ok());
    }

    #[test]
    fn test_validate_identifier_empty() {
        let result = validate_clickhouse_identifier("", "Database");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_validate_identifier_invalid_characters() {
        assert!(validate_clickhouse_identifier("my-db", "Database").is_err());
        assert!(validate_clickhouse_identifier("my db", "Database").is_err());
        // SQL injection attempt
        assert!(validate_clickhouse_identifier("db'; DROP DATABASE x; --", "Database").is_err());
    }

    #[test]
    fn test_validate_identifier_starts_with_digit() {
        let result = validate_clickhouse_identifier("1db", "Database");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot start with a digit"));
    }

    #[test]
    fn test_privilege_denied_classification() {
        let err = ClickhouseError::from_response_body(
            "SELECT name FROM system.users",
            "Code: 497. DB::Exception: alice: Not enough privileges. (ACCESS_DENIED)",
        );
        assert!(err.is_privilege_denied());
    }

    #[test]
    fn test_generic_failure_classification() {
        let err = ClickhouseError::from_response_body(
            "CREATE DATABASE foo",
            "Code: 82. DB::Exception: Database foo already exists.",
        );
        assert!(!err.is_privilege_denied());
        assert!(matches!(
            err,
            ClickhouseError::StatementExecutionFailure { .. }
        ));
    }
}
