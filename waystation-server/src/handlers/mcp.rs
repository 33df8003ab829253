//! Remote MCP server routes.
//!
//! Bearer/none servers are created directly after a connection probe;
//! OAuth servers must come through the initiate/callback flow, which
//! keeps its pending state in memory (a restart simply restarts the
//! flow).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use waystation_core::types::{McpAuthType, McpStatus, RemoteMcpServer};
use waystation_core::{Error, McpServerPatch, NewMcpServer};

use crate::error::{bad_request, not_found, ApiResult};
use crate::state::AppState;

/// An OAuth flow awaiting its callback, keyed by `state`.
#[derive(Debug, Clone)]
pub struct PendingOauth {
    pub name: String,
    pub url: String,
    pub token_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
}

pub type OauthFlows = parking_lot::Mutex<HashMap<String, PendingOauth>>;

// ---------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateMcpRequest {
    pub name: String,
    pub url: String,
    pub auth_type: McpAuthType,
    #[serde(default)]
    pub access_token: Option<String>,
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<CreateMcpRequest>,
) -> ApiResult<(StatusCode, Json<RemoteMcpServer>)> {
    if request.auth_type == McpAuthType::Oauth {
        return Err(bad_request(
            "OAuth servers are registered through the OAuth flow",
        ));
    }
    if request.auth_type == McpAuthType::Bearer && request.access_token.is_none() {
        return Err(bad_request("bearer servers require an access token"));
    }
    probe(&request.url, request.access_token.as_deref()).await?;

    let server = state.db.create_mcp_server(NewMcpServer {
        name: request.name,
        url: request.url,
        auth_type: request.auth_type,
        access_token: request.access_token,
        refresh_token: None,
        oauth_client_secret: None,
    })?;
    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn list_servers(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<RemoteMcpServer>>> {
    Ok(Json(state.db.list_mcp_servers()?))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RemoteMcpServer>> {
    let server = state
        .db
        .get_mcp_server(&id)?
        .ok_or_else(|| not_found(format!("remote MCP server {}", id)))?;
    Ok(Json(server))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PatchMcpRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

pub async fn patch_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchMcpRequest>,
) -> ApiResult<Json<RemoteMcpServer>> {
    let server = state.db.patch_mcp_server(
        &id,
        McpServerPatch {
            name: request.name,
            url: request.url,
            access_token: request.access_token,
        },
    )?;
    Ok(Json(server))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.delete_mcp_server(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------

async fn probe(url: &str, token: Option<&str>) -> ApiResult<()> {
    let mut request = reqwest::Client::new()
        .get(url)
        .timeout(std::time::Duration::from_secs(10));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("connection probe failed: {}", e)))?;
    // Auth challenges still prove the endpoint is there.
    if response.status().is_server_error() {
        return Err(Error::Upstream(format!(
            "connection probe returned {}",
            response.status()
        ))
        .into());
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionResponse {
    pub ok: bool,
    pub status: McpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TestConnectionResponse>> {
    let server = state
        .db
        .get_mcp_server(&id)?
        .ok_or_else(|| not_found(format!("remote MCP server {}", id)))?;

    match probe(&server.url, server.access_token.as_deref()).await {
        Ok(()) => {
            state.db.set_mcp_status(&id, McpStatus::Active, None)?;
            Ok(Json(TestConnectionResponse {
                ok: true,
                status: McpStatus::Active,
                error: None,
            }))
        }
        Err(e) => {
            let message = e.0.to_string();
            state
                .db
                .set_mcp_status(&id, McpStatus::Error, Some(&message))?;
            Ok(Json(TestConnectionResponse {
                ok: false,
                status: McpStatus::Error,
                error: Some(message),
            }))
        }
    }
}

#[derive(Serialize)]
pub struct DiscoverToolsResponse {
    pub tools: Vec<serde_json::Value>,
}

/// One-shot `tools/list` over rmcp's streamable HTTP transport: connect,
/// list, disconnect.
async fn list_remote_tools(
    url: &str,
    access_token: Option<&str>,
) -> Result<Vec<serde_json::Value>, Error> {
    use rmcp::transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    };
    use rmcp::ServiceExt;

    let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(token) = access_token {
        let value = reqwest::header::HeaderValue::try_from(format!("Bearer {}", token))
            .map_err(|e| Error::Validation(format!("invalid access token: {}", e)))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    let http_client = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
    let transport = StreamableHttpClientTransport::with_client(http_client, config);

    let service = ()
        .serve(transport)
        .await
        .map_err(|e| Error::Upstream(format!("MCP connect failed: {}", e)))?;
    let listed = service
        .list_tools(Default::default())
        .await
        .map_err(|e| Error::Upstream(format!("tools/list failed: {}", e)));
    let _ = service.cancel().await;

    Ok(listed?
        .tools
        .into_iter()
        .map(|tool| {
            serde_json::json!({
                "name": tool.name.to_string(),
                "description": tool.description.unwrap_or_default().to_string(),
                "inputSchema": serde_json::Value::Object((*tool.input_schema).clone()),
            })
        })
        .collect())
}

/// Discover the server's tools; the result is persisted on the record
/// for the authoring UI.
pub async fn discover_tools(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DiscoverToolsResponse>> {
    let server = state
        .db
        .get_mcp_server(&id)?
        .ok_or_else(|| not_found(format!("remote MCP server {}", id)))?;

    match list_remote_tools(&server.url, server.access_token.as_deref()).await {
        Ok(tools) => {
            let tools_json = serde_json::to_string(&tools).map_err(Error::from)?;
            state.db.set_mcp_tools(&id, &tools_json, Utc::now())?;
            Ok(Json(DiscoverToolsResponse { tools }))
        }
        Err(e) => {
            state
                .db
                .set_mcp_status(&id, McpStatus::Error, Some(&e.to_string()))?;
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------
// OAuth flow
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitiateOauthRequest {
    pub name: String,
    pub url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateOauthResponse {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct OauthMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
}

/// Discover the server's OAuth metadata and hand the UI an authorization
/// URL. The flow completes at `oauth-callback`.
pub async fn initiate_oauth(
    State(state): State<AppState>,
    Json(request): Json<InitiateOauthRequest>,
) -> ApiResult<Json<InitiateOauthResponse>> {
    let origin = origin_of(&request.url)?;
    let metadata_url = format!("{}/.well-known/oauth-authorization-server", origin);
    let metadata: OauthMetadata = reqwest::Client::new()
        .get(&metadata_url)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("metadata discovery failed: {}", e)))?
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("metadata response: {}", e)))?;

    let flow_state = Uuid::new_v4().to_string();
    let redirect_uri = format!("{}://oauth/mcp-callback", state.protocol_scheme);
    let authorization_url = format!(
        "{}?response_type=code&client_id=waystation&redirect_uri={}&state={}",
        metadata.authorization_endpoint,
        urlencode(&redirect_uri),
        flow_state,
    );

    state.mcp_oauth.lock().insert(
        flow_state.clone(),
        PendingOauth {
            name: request.name,
            url: request.url,
            token_endpoint: metadata.token_endpoint,
            client_id: "waystation".to_string(),
            redirect_uri,
        },
    );
    Ok(Json(InitiateOauthResponse {
        authorization_url,
        state: flow_state,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OauthCallbackQuery {
    pub state: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchange the authorization code and register the server.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<OauthCallbackQuery>,
) -> ApiResult<Json<RemoteMcpServer>> {
    let pending = state
        .mcp_oauth
        .lock()
        .remove(&query.state)
        .ok_or_else(|| bad_request("unknown or expired OAuth state"))?;

    let tokens: TokenResponse = reqwest::Client::new()
        .post(&pending.token_endpoint)
        .timeout(std::time::Duration::from_secs(15))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", query.code.as_str()),
            ("client_id", pending.client_id.as_str()),
            ("redirect_uri", pending.redirect_uri.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("token exchange failed: {}", e)))?
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("token response: {}", e)))?;

    let server = state.db.create_mcp_server(NewMcpServer {
        name: pending.name,
        url: pending.url,
        auth_type: McpAuthType::Oauth,
        access_token: Some(tokens.access_token),
        refresh_token: tokens.refresh_token,
        oauth_client_secret: None,
    })?;
    Ok(Json(server))
}

fn origin_of(raw: &str) -> ApiResult<String> {
    let parsed = url::Url::parse(raw).map_err(|e| bad_request(format!("invalid url: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| bad_request("url has no host"))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://mcp.example.com/sse").unwrap(),
            "https://mcp.example.com"
        );
        assert_eq!(
            origin_of("http://127.0.0.1:8123/mcp").unwrap(),
            "http://127.0.0.1:8123"
        );
        assert!(origin_of("not a url").is_err());
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("waystation://oauth"), "waystation%3A%2F%2Foauth");
    }
}
