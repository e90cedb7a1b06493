//! HTTP client for the proxy's provider configuration API.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use tracing::debug;

use super::{DynamicConfig, ProxyApi, ProxyFuture};
use crate::error::ProxyError;

/// Proxy control API over HTTP.
///
/// Configuration is posted to `{api}/api/providers/{provider}/configure`;
/// routers and services are deleted under
/// `{api}/api/providers/{provider}/routers/{name}` and `.../services/{name}`.
#[derive(Debug, Clone)]
pub struct HttpProxyClient {
    client: Client,
    provider_url: String,
}

impl HttpProxyClient {
    /// Create a client for the API at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ClientFailed` if the HTTP client cannot be built.
    pub fn new(api_url: &str, provider: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cestx/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| ProxyError::ClientFailed {
                message: error.to_string(),
            })?;
        Ok(Self {
            client,
            provider_url: format!("{}/api/providers/{provider}", api_url.trim_end_matches('/')),
        })
    }

    async fn send(
        &self,
        method: Method,
        resource: String,
        body: Option<&DynamicConfig>,
    ) -> Result<(), ProxyError> {
        let url = format!("{}/{resource}", self.provider_url);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(config) = body {
            request = request.json(config);
        }

        let response = request.send().await.map_err(|error| ProxyError::RequestFailed {
            resource: resource.clone(),
            message: error.to_string(),
        })?;
        let status: StatusCode = response.status();
        debug!(%method, %url, status = status.as_u16(), "proxy API call");

        if status.is_success() {
            Ok(())
        } else {
            Err(ProxyError::Status {
                resource,
                status: status.as_u16(),
            })
        }
    }
}

impl ProxyApi for HttpProxyClient {
    fn apply<'a>(&'a self, config: &'a DynamicConfig) -> ProxyFuture<'a> {
        Box::pin(self.send(Method::POST, String::from("configure"), Some(config)))
    }

    fn delete_router<'a>(&'a self, name: &'a str) -> ProxyFuture<'a> {
        Box::pin(self.send(Method::DELETE, format!("routers/{name}"), None))
    }

    fn delete_service<'a>(&'a self, name: &'a str) -> ProxyFuture<'a> {
        Box::pin(self.send(Method::DELETE, format!("services/{name}"), None))
    }
}
