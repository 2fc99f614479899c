// Scope discovery

use super::types::{Scope, SUPPORTED_SCOPES};
use crate::error::{DaemonError, Result};
use crate::metadata::MetadataSource;

/// Split the metadata server's scope listing on any whitespace
pub fn parse_scopes(body: &str) -> Vec<String> {
    body.split_whitespace().map(str::to_string).collect()
}

/// Pick the highest-priority allow-listed scope granted to this VM
pub async fn select_scope<M: MetadataSource + ?Sized>(metadata: &M) -> Result<Scope> {
    let body = metadata.get("scopes").await?;
    let available = parse_scopes(&body);
    tracing::debug!("Available scopes: {:?}", available);

    SUPPORTED_SCOPES
        .iter()
        .find(|wanted| available.iter().any(|have| have == *wanted))
        .map(|scope| {
            tracing::info!("Using scope {}", scope);
            Scope::new(*scope)
        })
        .ok_or(DaemonError::NoSupportedScope { available })
}
