//! Error handling module
//!
//! Structured error taxonomy for the audit. Per-GPO failures are mapped onto
//! these variants and degrade toward "not writable"; only root-level
//! connectivity loss aborts a run.

use thiserror::Error;

/// Main error type for audit operations
#[derive(Error, Debug)]
pub enum AuditError {
    /// Malformed security descriptor or ACL
    #[error("Failed to parse data: {0}")]
    Parse(String),

    /// Missing directory object, group or container
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// ACL or object unreadable for the acting identity
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Directory or policy root unreachable
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    /// A single GPO's source data is structurally invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Per-call timeout; retryable
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Capability not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuditError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::Timeout(_))
    }

    /// Short machine-readable code used in reports
    pub fn code(&self) -> &'static str {
        match self {
            AuditError::Parse(_) => "PARSE_ERROR",
            AuditError::NotFound(_) => "NOT_FOUND",
            AuditError::AccessDenied(_) => "ACCESS_DENIED",
            AuditError::Connectivity(_) => "CONNECTIVITY",
            AuditError::Configuration(_) => "CONFIGURATION",
            AuditError::Timeout(_) => "TIMEOUT",
            AuditError::Unsupported(_) => "UNSUPPORTED",
            AuditError::Io(_) => "IO_ERROR",
            AuditError::Json(_) => "JSON_ERROR",
        }
    }
}

impl From<ldap3::LdapError> for AuditError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => match result.rc {
                // 32 = No such object
                32 => AuditError::NotFound(format!("Object not found: {}", result.text)),
                // 49 = Invalid credentials
                49 => AuditError::Connectivity(format!("Invalid credentials: {}", result.text)),
                // 50 = Insufficient access rights
                50 => AuditError::AccessDenied(format!(
                    "Insufficient access rights: {}",
                    result.text
                )),
                // 51 = Busy
                51 => AuditError::Timeout(format!("Server is busy: {}", result.text)),
                // 52 = Unavailable
                52 => AuditError::Connectivity(format!("Server unavailable: {}", result.text)),
                // 53 = Unwilling to perform
                53 => AuditError::AccessDenied(format!(
                    "Server unwilling to perform operation: {}",
                    result.text
                )),
                _ => AuditError::Connectivity(format!(
                    "LDAP error code {}: {}",
                    result.rc, result.text
                )),
            },
            ldap3::LdapError::EndOfStream => {
                AuditError::Connectivity("Connection closed unexpectedly".to_string())
            }
            ldap3::LdapError::Io { source } => {
                AuditError::Connectivity(format!("I/O error: {}", source))
            }
            ldap3::LdapError::Timeout { elapsed: _ } => {
                AuditError::Timeout("LDAP operation timed out".to_string())
            }
            _ => AuditError::Connectivity(format!("LDAP error: {}", err)),
        }
    }
}

/// Result type alias for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;
