//! Thin HTTP proxy over the read-only market REST API.
//!
//! Every `/api/*` request is forwarded one-to-one to the backing service
//! (`/api/bars/{symbol}`, `/api/bars/{symbol}/range`, `/api/bars/latest`,
//! quote/profile/news/financials/earnings/dividends) and the response body
//! is returned unchanged.

use crate::ws_server::AppState;
use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Forwarding timeout; an upstream slower than this yields 504.
const PROXY_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client plus the backing API base URL.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub base_url: String,
}

impl ProxyState {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Target URL for a proxied request.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}/api/{}?{}", self.base_url, path, q),
            _ => format!("{}/api/{}", self.base_url, path),
        }
    }
}

/// Proxy routes: everything under `/api/` passes through.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/{*path}", get(proxy_handler))
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let url = state.proxy.target_url(&path, query.as_deref());
    debug!("proxying to {url}");

    let sent = state
        .proxy
        .client
        .get(&url)
        .timeout(PROXY_TIMEOUT)
        .send()
        .await;

    match sent {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            match resp.bytes().await {
                Ok(body) => Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .unwrap_or_else(|_| proxy_error(StatusCode::BAD_GATEWAY, "bad upstream response")),
                Err(e) => {
                    warn!("proxy body read failed for {url}: {e}");
                    proxy_error(StatusCode::BAD_GATEWAY, &e.to_string())
                }
            }
        }
        Err(e) if e.is_timeout() => {
            warn!("proxy timeout for {url}");
            proxy_error(StatusCode::GATEWAY_TIMEOUT, "upstream timeout")
        }
        Err(e) => {
            warn!("proxy request failed for {url}: {e}");
            proxy_error(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

fn proxy_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_urls_forward_path_and_query() {
        let proxy = ProxyState::new("http://api.internal:8000/".to_string());
        assert_eq!(
            proxy.target_url("bars/AAPL", Some("limit=10")),
            "http://api.internal:8000/api/bars/AAPL?limit=10"
        );
        assert_eq!(
            proxy.target_url("bars/AAPL/range", Some("start=1&end=2&limit=5")),
            "http://api.internal:8000/api/bars/AAPL/range?start=1&end=2&limit=5"
        );
        assert_eq!(
            proxy.target_url("quote/MSFT", None),
            "http://api.internal:8000/api/quote/MSFT"
        );
        assert_eq!(
            proxy.target_url("bars/latest", Some("")),
            "http://api.internal:8000/api/bars/latest"
        );
    }
}
