use serde_json::json;

/// Errors returned by the storage collaborator
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the credential store
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Username already exists")]
    UserExists,

    #[error("Passwords don't match")]
    PasswordMismatch,

    #[error("Invalid signup: {0}")]
    InvalidSignup(String),

    #[error("Password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),
}

/// Errors surfaced to callers of the monitoring core.
///
/// Probe failures never appear here; they are recorded as down outcomes.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Site already exists: {url}")]
    DuplicateTarget { url: String },

    #[error("Site not found: {url}")]
    NotFound { url: String },

    #[error("Not authenticated")]
    Unauthorized,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StorageError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

impl MonitorError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MonitorError::InvalidInput(msg.into())
    }

    /// Stable, machine-readable error category
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::InvalidInput(_) => "invalid_input",
            MonitorError::DuplicateTarget { .. } => "duplicate_target",
            MonitorError::NotFound { .. } => "not_found",
            MonitorError::Unauthorized => "unauthorized",
            MonitorError::Auth(AuthError::InvalidCredentials) => "unauthorized",
            MonitorError::Auth(_) => "invalid_input",
            MonitorError::Persistence(_) => "persistence",
        }
    }

    /// HTTP status a handler should answer with
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            "invalid_input" => 400,
            "duplicate_target" => 409,
            "not_found" => 404,
            "unauthorized" => 401,
            _ => 500,
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MonitorError::Persistence(_))
    }
}

/// Build the JSON body a handler returns for a rejected operation
pub fn create_error_response(error: &MonitorError) -> serde_json::Value {
    json!({
        "success": false,
        "error": {
            "reason": error.to_string(),
            "kind": error.kind(),
            "status": error.status_code(),
            "recoverable": error.is_recoverable()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_response() {
        let error = MonitorError::DuplicateTarget {
            url: "http://x.test".to_string(),
        };
        let body = create_error_response(&error);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "duplicate_target");
        assert_eq!(body["error"]["status"], 409);
        assert!(body["error"]["reason"]
            .as_str()
            .unwrap()
            .contains("already exists"));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(MonitorError::invalid("bad url").status_code(), 400);
        assert_eq!(MonitorError::Unauthorized.status_code(), 401);
        assert_eq!(
            MonitorError::from(AuthError::InvalidCredentials).status_code(),
            401
        );
        assert_eq!(
            MonitorError::from(AuthError::UserExists).kind(),
            "invalid_input"
        );
        let persistence = MonitorError::from(StorageError::Unavailable("disk".into()));
        assert_eq!(persistence.status_code(), 500);
        assert!(persistence.is_recoverable());
    }
}
