// Authentication types

use serde::Deserialize;
use std::fmt;

/// Scopes this daemon can use, highest priority first
pub const SUPPORTED_SCOPES: [&str; 5] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/gerritcodereview",
    "https://www.googleapis.com/auth/source.full_control",
    "https://www.googleapis.com/auth/source.read_write",
    "https://www.googleapis.com/auth/source.read_only",
];

/// Authorization scope selected once per daemon lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope(String);

impl Scope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token from the metadata server's token endpoint
///
/// Extra fields such as `token_type` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub expires_in: i64,
}

impl Token {
    /// Absolute expiry (Unix seconds) for a token received at `now`
    pub fn expires_at(&self, now: i64) -> i64 {
        now.saturating_add(self.expires_in)
    }
}
