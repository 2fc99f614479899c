// GCE metadata server client

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;

use crate::error::{DaemonError, Result};

/// Header the metadata server requires on every request
pub const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
pub const METADATA_FLAVOR_VALUE: &str = "Google";

/// Default metadata server host on GCE
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Build the service-account base URL for a metadata host
pub fn service_account_url(host: &str, account: &str) -> String {
    format!(
        "http://{}/computeMetadata/v1/instance/service-accounts/{}/",
        host.trim_end_matches('/'),
        account
    )
}

/// Read-only access to the instance metadata service
///
/// Implemented by [`MetadataClient`]; scope selection and token acquisition
/// are written against this trait so they can run against any source.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// GET `path` relative to the service-account base URL, returning the body on 200
    async fn get_with_query(&self, path: &str, query: &[(&str, &str)]) -> Result<String>;

    async fn get(&self, path: &str) -> Result<String> {
        self.get_with_query(path, &[]).await
    }
}

/// HTTP client for the GCE metadata server
pub struct MetadataClient {
    /// HTTP client with the trust header preset
    client: Client,

    /// Base URL every request path is appended to (always ends with '/')
    base_url: String,
}

impl MetadataClient {
    /// Create a new client for `base_url`
    ///
    /// No request timeout is configured: a hung connection surfaces only when
    /// the transport itself gives up.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(
            METADATA_FLAVOR_HEADER,
            HeaderValue::from_static(METADATA_FLAVOR_VALUE),
        );

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("git-cookie-authdaemon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DaemonError::TransientNetwork(format!("Failed to create HTTP client: {}", e)))?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self { client, base_url })
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MetadataSource for MetadataClient {
    async fn get_with_query(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, path.trim_start_matches('/'));

        tracing::debug!(url = %url, "Sending metadata request");

        let mut request = self.client.get(&url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(url = %url, error = %e, "Metadata request error");
            DaemonError::from(e)
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                status = %status,
                url = %url,
                response_body = %body,
                "Metadata server returned error response"
            );
            return Err(DaemonError::TransientNetwork(format!(
                "{} returned {}",
                url, status
            )));
        }

        Ok(response.text().await?)
    }
}
