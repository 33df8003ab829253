//! Upstream token broker client.
//!
//! The broker (a Composio-style service) owns the real OAuth dance and
//! hands out short-lived upstream access tokens for a connected account.
//! It is an opaque RPC endpoint to us; the trait seam keeps tests and the
//! proxy pipeline independent of its wire details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use waystation_core::{Error, Result};

/// A freshly initiated connection: the user finishes auth at
/// `redirect_url`, then the account is completed against
/// `connection_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct InitiatedConnection {
    #[serde(rename = "id")]
    pub connection_id: String,
    #[serde(rename = "redirectUrl")]
    pub redirect_url: String,
}

/// A real upstream access token with its expiry.
#[derive(Debug, Clone)]
pub struct BrokeredToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenBroker: Send + Sync {
    /// Begin authorizing a new account for `toolkit`.
    async fn initiate_connection(&self, toolkit: &str) -> Result<InitiatedConnection>;

    /// Has the user finished the auth flow for this connection?
    async fn connection_active(&self, connection_id: &str) -> Result<bool>;

    /// Fetch the current upstream access token for this connection.
    async fn fetch_token(&self, connection_id: &str) -> Result<BrokeredToken>;
}

/// HTTP client for the hosted broker.
pub struct ComposioBroker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionStatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl ComposioBroker {
    pub fn new(base_url: impl Into<String>, api_key: String, user_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            user_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout(format!("broker: {}", e))
                } else {
                    Error::Upstream(format!("broker: {}", e))
                }
            })?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "broker returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TokenBroker for ComposioBroker {
    async fn initiate_connection(&self, toolkit: &str) -> Result<InitiatedConnection> {
        let response = self
            .send(self.client.post(self.url("/api/v3/connected_accounts/link")).json(
                &serde_json::json!({
                    "toolkit_slug": toolkit,
                    "user_id": self.user_id,
                }),
            ))
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("broker response: {}", e)))
    }

    async fn connection_active(&self, connection_id: &str) -> Result<bool> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/api/v3/connected_accounts/{}", connection_id))),
            )
            .await?;
        let body: ConnectionStatusBody = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("broker response: {}", e)))?;
        Ok(body.status.eq_ignore_ascii_case("active"))
    }

    async fn fetch_token(&self, connection_id: &str) -> Result<BrokeredToken> {
        let response = self
            .send(self.client.get(self.url(&format!(
                "/api/v3/connected_accounts/{}/credentials",
                connection_id
            ))))
            .await?;
        let body: TokenBody = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("broker response: {}", e)))?;
        Ok(BrokeredToken {
            access_token: body.access_token,
            expires_at: body
                .expires_at
                .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(10)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/connected_accounts/conn-1/credentials"))
            .and(header("x-api-key", "ck-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "ya29.real",
                "expiresAt": "2030-01-01T00:00:00Z",
            })))
            .mount(&server)
            .await;

        let broker = ComposioBroker::new(server.uri(), "ck-test".into(), "user-1".into());
        let token = broker.fetch_token("conn-1").await.unwrap();
        assert_eq!(token.access_token, "ya29.real");
    }

    #[tokio::test]
    async fn test_broker_error_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let broker = ComposioBroker::new(server.uri(), "ck-test".into(), "user-1".into());
        let err = broker.fetch_token("conn-1").await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_connection_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/connected_accounts/conn-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ACTIVE",
            })))
            .mount(&server)
            .await;

        let broker = ComposioBroker::new(server.uri(), "ck-test".into(), "user-1".into());
        assert!(broker.connection_active("conn-2").await.unwrap());
    }
}
