//! REST gateway built on reqwest.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::gateway::NetworkGateway;
use crate::request::{Method, SerializedRequest};
use crate::response::GatewayResponse;
use offsync_common::{Error, Result, StatusCategory};

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings of the REST backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGatewayConfig {
    /// Base URL collections are resolved against, e.g.
    /// `https://api.example.com/appdata/my-app/`.
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpGatewayConfig {
    /// Create a config for `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Set the bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Gateway speaking the backend's REST protocol.
pub struct HttpGateway {
    http: Client,
    base: Url,
    auth_token: Option<String>,
}

impl HttpGateway {
    /// Create a gateway.
    ///
    /// # Errors
    /// - The base URL does not parse
    /// - The HTTP client cannot be built
    pub fn new(config: &HttpGatewayConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        // Without a trailing slash `join` would replace the last segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent("offsync/0.1")
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            auth_token: config.auth_token.clone(),
        })
    }

    fn url_for(&self, request: &SerializedRequest) -> Result<Url> {
        self.base
            .join(&request.path)
            .map_err(|e| Error::InvalidInput(format!("Invalid request path {}: {}", request.path, e)))
    }

    async fn execute(&self, request: &SerializedRequest) -> Result<GatewayResponse> {
        let url = self.url_for(request)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        debug!("{} {}", method, url);

        let mut builder = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json")
            .query(&request.params);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::NetworkUnreachable(format!("Request failed: {}", e)))?;

        let body = self.handle_response(response).await?;
        GatewayResponse::decode(request.expect, body)
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            Ok(serde_json::json!({ "count": 1 }))
        } else if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(
                Error::from_status(status.as_u16(), body.clone()).unwrap_or(Error::ServerRejected {
                    status: StatusCategory::ServerError(status.as_u16()),
                    message: body,
                }),
            )
        }
    }
}

#[async_trait]
impl NetworkGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        request: &SerializedRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.execute(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestFactory;
    use offsync_common::{CollectionName, Query, Record};

    fn gateway(base: &str) -> HttpGateway {
        HttpGateway::new(&HttpGatewayConfig::new(base)).unwrap()
    }

    #[test]
    fn test_paths_resolve_below_base() {
        let factory = RequestFactory::new(CollectionName::new("books").unwrap());
        let gateway = gateway("https://api.example.com/appdata/app1");

        let url = gateway.url_for(&factory.get_by_id("b1")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/appdata/app1/books/b1");

        let url = gateway.url_for(&factory.count(&Query::all())).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/appdata/app1/books/_count");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpGateway::new(&HttpGatewayConfig::new("not a url")).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: HttpGatewayConfig =
            serde_json::from_str(r#"{"base_url":"https://api.example.com/"}"#).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.auth_token, None);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let gateway = gateway("http://127.0.0.1:9/");
        let factory = RequestFactory::new(CollectionName::new("books").unwrap());
        let result = gateway
            .send(&factory.save(&Record::with_id("a")), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NetworkUnreachable(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let gateway = gateway("http://127.0.0.1:9/");
        let factory = RequestFactory::new(CollectionName::new("books").unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gateway.send(&factory.get_by_id("a"), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
