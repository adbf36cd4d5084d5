use thiserror::Error;

/// Errors produced by the adapter layer, the tool registry and the session.
///
/// Guard rejections and descriptor mismatches always reach the immediate
/// caller. Write-tool failures are caught at the tool-registry boundary and
/// turned into a textual result so the conversation can continue.
#[derive(Debug, Error)]
pub enum DbError {
    /// The connection URL does not match the declared backend kind.
    /// Raised before any connection attempt.
    #[error("invalid connection descriptor for {kind}: {reason}")]
    InvalidDescriptor { kind: String, reason: String },

    /// The backend kind string is not one we know how to construct.
    #[error("unsupported database type: {0}")]
    UnsupportedBackend(String),

    /// The backend was unreachable or rejected the connection.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The validation guard rejected a raw query string.
    #[error("forbidden operation: {keyword}")]
    ForbiddenOperation { keyword: String },

    /// Wrong query arm for the backend, or a required field is missing.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// A backend-native failure during execute/insert/update/delete/aggregate.
    #[error("{operation} failed: {message}")]
    AdapterOperation { operation: String, message: String },

    /// begin/commit/rollback called out of sequence.
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// The model collaborator was unreachable or rejected the request.
    /// Turn-fatal; never converted into a tool result.
    #[error("model request failed: {0}")]
    Llm(String),
}

impl DbError {
    /// Wrap a backend-native error for a named adapter operation.
    pub fn operation(operation: &str, err: impl std::fmt::Display) -> Self {
        DbError::AdapterOperation {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// Rewrite known noisy collaborator/backend error text into something a user
/// can act on. Unrecognized messages pass through verbatim.
pub fn friendly_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("connection refused") || lower.contains("could not connect") {
        return "Could not connect to the database. Check the connection URL and make sure the \
                database is running."
            .to_string();
    }
    if lower.contains("authentication failed") || lower.contains("password authentication") {
        return "Authentication failed. Check your username and password.".to_string();
    }
    if lower.contains("unescaped") || lower.contains("url-encoded") || lower.contains("rfc 3986") {
        return "The connection string contains special characters. URL-encode the username and \
                password (for example '@' as '%40')."
            .to_string();
    }
    if lower.contains("unsupported database type") || lower.contains("invalid choice") {
        return "Invalid database type. Choose from: postgres, mysql, sqlite or mongodb."
            .to_string();
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friendly_connection_refused() {
        let msg = friendly_message("error: Connection refused (os error 111)");
        assert!(msg.contains("Check the connection URL"));
    }

    #[test]
    fn test_friendly_auth_failure() {
        let msg = friendly_message("FATAL: password authentication failed for user \"app\"");
        assert!(msg.contains("username and password"));
    }

    #[test]
    fn test_friendly_unescaped_uri_credentials() {
        let msg = friendly_message(
            "error parsing connection string: username/password must be URL-encoded (RFC 3986)",
        );
        assert!(msg.contains("URL-encode"));
        assert!(msg.contains("%40"));
    }

    #[test]
    fn test_friendly_passthrough() {
        assert_eq!(friendly_message("relation \"users\" does not exist"),
            "relation \"users\" does not exist");
    }

    #[test]
    fn test_operation_wrapper_display() {
        let err = DbError::operation("insert", "duplicate key");
        assert_eq!(err.to_string(), "insert failed: duplicate key");
    }
}
