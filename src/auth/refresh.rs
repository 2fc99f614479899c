// Token acquisition from the metadata server

use std::time::Duration;

use super::types::{Scope, Token};
use crate::error::{DaemonError, Result};
use crate::metadata::MetadataSource;

/// Longest token lifetime accepted from the metadata server (one day)
pub const MAX_EXPIRES_IN: i64 = 24 * 60 * 60;

/// How `acquire_token` reacts to transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Propagate the first failure (startup)
    FailFast,

    /// Sleep `interval` and try again, forever, with no backoff growth
    Forever { interval: Duration },
}

/// Fetch a fresh token for `scope`
pub async fn acquire_token<M: MetadataSource + ?Sized>(
    metadata: &M,
    scope: &Scope,
    retry: RetryPolicy,
) -> Result<Token> {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let result = fetch_token(metadata, scope).await;

        match (result, retry) {
            (Ok(token), _) => {
                if attempt > 1 {
                    tracing::info!("Token acquired after {} attempts", attempt);
                }
                return Ok(token);
            }
            (Err(e), RetryPolicy::Forever { interval }) if e.is_transient() => {
                tracing::debug!(
                    attempt = attempt,
                    error = %e,
                    "Token request failed, retrying in {}s",
                    interval.as_secs_f64()
                );
                tokio::time::sleep(interval).await;
            }
            (Err(e), _) => return Err(e),
        }
    }
}

/// One token request, decoded and sanity-checked
async fn fetch_token<M: MetadataSource + ?Sized>(metadata: &M, scope: &Scope) -> Result<Token> {
    let body = metadata
        .get_with_query("token", &[("scopes", scope.as_str())])
        .await?;

    let token: Token = serde_json::from_str(&body)
        .map_err(|e| DaemonError::InvalidTokenResponse(format!("{}", e)))?;

    if token.access_token.is_empty() {
        return Err(DaemonError::InvalidTokenResponse(
            "response does not contain access_token".to_string(),
        ));
    }
    if token.expires_in <= 0 {
        return Err(DaemonError::InvalidTokenResponse(format!(
            "non-positive expires_in: {}",
            token.expires_in
        )));
    }
    if token.expires_in > MAX_EXPIRES_IN {
        return Err(DaemonError::InvalidTokenResponse(format!(
            "expires_in {} exceeds {}",
            token.expires_in, MAX_EXPIRES_IN
        )));
    }

    tracing::debug!(
        "Received token {}... (expires in {}s)",
        &token.access_token[..8.min(token.access_token.len())],
        token.expires_in
    );

    Ok(token)
}
