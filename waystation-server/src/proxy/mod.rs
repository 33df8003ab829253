//! Credential proxy.
//!
//! A reverse proxy rooted at `/proxy/:agentSlug/:accountId/<host>/<path…>`
//! that swaps the container's synthetic bearer for a real upstream token.
//! The synthetic token, the agent↔account mapping, and the toolkit host
//! allowlist together give the container exactly the authority of one
//! upstream account, scoped to that toolkit's hosts, and nothing more.
//!
//! Real tokens never appear in a response, a log line, or an error
//! message. Every request — allowed or refused — leaves an audit row.

pub mod allowlist;
pub mod broker;
pub mod token_cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method};
use axum::response::{IntoResponse, Response};

use waystation_core::{Database, Error, NewAuditEntry};

use crate::state::AppState;
pub use allowlist::Allowlist;
pub use broker::{ComposioBroker, TokenBroker};
pub use token_cache::TokenCache;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Headers never forwarded in either direction.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::HOST,
    header::AUTHORIZATION,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

pub struct ProxyService {
    db: Database,
    allowlist: Allowlist,
    broker: Arc<dyn TokenBroker>,
    cache: TokenCache,
    client: reqwest::Client,
    upstream_scheme: String,
    default_timeout: Duration,
    toolkit_timeouts: HashMap<String, Duration>,
}

impl ProxyService {
    pub fn new(db: Database, broker: Arc<dyn TokenBroker>) -> Self {
        Self {
            db,
            allowlist: Allowlist::builtin(),
            broker,
            cache: TokenCache::new(),
            client: reqwest::Client::new(),
            upstream_scheme: "https".to_string(),
            default_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            toolkit_timeouts: HashMap::new(),
        }
    }

    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Tests point this at plain-HTTP mock upstreams.
    pub fn with_upstream_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.upstream_scheme = scheme.into();
        self
    }

    pub fn with_toolkit_timeout(mut self, toolkit: &str, timeout: Duration) -> Self {
        self.toolkit_timeouts.insert(toolkit.to_string(), timeout);
        self
    }

    pub fn broker(&self) -> Arc<dyn TokenBroker> {
        self.broker.clone()
    }

    pub fn clear_token_cache(&self) {
        self.cache.clear();
    }

    fn timeout_for(&self, toolkit: &str) -> Duration {
        self.toolkit_timeouts
            .get(toolkit)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Run the full pipeline and always leave an audit row behind.
    pub async fn handle(
        &self,
        agent_slug: &str,
        account_id: &str,
        rest: &str,
        method: Method,
        headers: &HeaderMap,
        query: Option<String>,
        body: Bytes,
    ) -> Response {
        let (host, path) = split_target(rest);
        let mut audit = NewAuditEntry {
            agent_slug: agent_slug.to_string(),
            account_id: account_id.to_string(),
            toolkit: String::new(),
            target_host: host.clone(),
            target_path: path.clone(),
            method: method.to_string(),
            status_code: None,
            error_message: None,
        };

        let outcome = self
            .pipeline(agent_slug, account_id, &host, &path, &method, headers, query, body, &mut audit)
            .await;

        match outcome {
            Ok(response) => {
                audit.status_code = Some(response.status().as_u16());
                self.write_audit(audit);
                response
            }
            Err(error) => {
                audit.error_message = Some(error.to_string());
                self.write_audit(audit);
                crate::error::ApiError(error).into_response()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pipeline(
        &self,
        agent_slug: &str,
        account_id: &str,
        host: &str,
        path: &str,
        method: &Method,
        headers: &HeaderMap,
        query: Option<String>,
        body: Bytes,
        audit: &mut NewAuditEntry,
    ) -> Result<Response, Error> {
        // 1. Synthetic bearer → bound agent.
        let token = bearer(headers)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;
        let bound = self
            .db
            .validate_token(token)?
            .ok_or_else(|| Error::Unauthorized("invalid or expired token".into()))?;
        if bound != agent_slug {
            return Err(Error::Forbidden("token is not bound to this agent".into()));
        }

        // 2. Agent × account join.
        let account = self
            .db
            .resolve_agent_account(agent_slug, account_id)?
            .ok_or_else(|| {
                Error::NotFound("Account not found or not mapped to this agent".into())
            })?;
        audit.toolkit = account.toolkit_slug.clone();

        // 3. Host allowlist, keyed by the account's toolkit.
        if host.is_empty() {
            return Err(Error::Validation("missing target host".into()));
        }
        if !self.allowlist.allows(&account.toolkit_slug, host) {
            return Err(Error::Forbidden(format!(
                "host {} is not allowed for toolkit {}",
                host, account.toolkit_slug
            )));
        }

        // 4. Real upstream token via the cache.
        let real_token = self
            .cache
            .get_or_fetch(&account.composio_connection_id, &self.broker)
            .await?;

        // 5. Forward.
        let url = match &query {
            Some(query) => format!("{}://{}{}?{}", self.upstream_scheme, host, path, query),
            None => format!("{}://{}{}", self.upstream_scheme, host, path),
        };
        let mut request = self
            .client
            .request(method.clone(), &url)
            .timeout(self.timeout_for(&account.toolkit_slug));
        for (name, value) in headers {
            if HOP_BY_HOP.contains(name) {
                continue;
            }
            request = request.header(name, value);
        }
        request = request.bearer_auth(&real_token);
        if *method != Method::GET && *method != Method::HEAD && !body.is_empty() {
            request = request.body(body);
        }

        let upstream = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::UpstreamTimeout(format!("upstream {}", host))
            } else {
                Error::Upstream(format!("upstream {}: {}", host, e))
            }
        })?;

        // 6. Mirror status + headers + body; non-2xx passes through as-is.
        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if name == header::TRANSFER_ENCODING
                || name == header::CONTENT_LENGTH
                || name == header::CONNECTION
            {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }
        let body = upstream
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("upstream body: {}", e)))?;

        Ok((status, response_headers, body).into_response())
    }

    /// Audit writes are best-effort and never block the response: one
    /// immediate retry, then the row is dropped with a warning.
    fn write_audit(&self, entry: NewAuditEntry) {
        let db = self.db.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let first = db.record_audit(entry.clone());
                if first.is_err() {
                    return db.record_audit(entry);
                }
                first
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "audit write dropped"),
                Err(e) => tracing::warn!(error = %e, "audit task failed"),
            }
        });
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Split a wildcard remainder into `(host, /path)`.
fn split_target(rest: &str) -> (String, String) {
    let rest = rest.trim_start_matches('/');
    match rest.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{}", path)),
        None => (rest.to_string(), "/".to_string()),
    }
}

/// Axum handler for `ANY /proxy/:agent_slug/:account_id/*rest`.
pub async fn proxy_handler(
    State(state): State<AppState>,
    Path((agent_slug, account_id, rest)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state
        .proxy
        .handle(&agent_slug, &account_id, &rest, method, &headers, query, body)
        .await
}
