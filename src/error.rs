// Error handling module
// Defines the daemon's error taxonomy (fatal vs. transient)

use std::path::PathBuf;
use thiserror::Error;

use crate::auth::SUPPORTED_SCOPES;

/// Errors raised while acquiring and persisting the credential
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Metadata server unreachable, timed out or answered with a non-200 status
    #[error("Metadata request failed: {0}")]
    TransientNetwork(String),

    /// Metadata server answered 200 but the token payload was unusable
    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    /// None of the allow-listed scopes is granted to this VM
    #[error(
        "No supported scope available (have: [{}], need one of: [{}])",
        .available.join(", "),
        SUPPORTED_SCOPES.join(", ")
    )]
    NoSupportedScope { available: Vec<String> },

    /// Required path or environment information is missing
    #[error("Missing environment: {0}")]
    MissingEnvironment(String),

    /// Filesystem failure on the cookie file or its directory
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `git config` could not be run or exited non-zero
    #[error("Git config error: {0}")]
    GitConfig(String),

    /// Could not hand off to a background process
    #[error("Failed to detach: {0}")]
    Detach(String),
}

impl DaemonError {
    /// Whether the steady-state loop should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaemonError::TransientNetwork(_) | DaemonError::InvalidTokenResponse(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaemonError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_body() || e.is_decode() {
            "body_error"
        } else {
            "request_error"
        };
        DaemonError::TransientNetwork(format!("{} (kind: {})", e, kind))
    }
}

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;
