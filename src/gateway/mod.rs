//! The HTTP↔bus gateway.
//!
//! A stateless proxy: `ANY /<subject>[/<suffix>]` becomes a bus
//! request/reply on `<subject>`, with the request body as the payload and
//! the HTTP method and suffix carried in the envelope. The optional
//! `_timeout` query parameter (a duration literal, default 5s) caps the
//! request. The reply chooses the response shape: the first HTML result
//! wins outright, otherwise the whole results mapping is returned as JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{Message, Reply, NO_SCRIPT_FOUND};
use crate::telemetry;

const TIMEOUT_QUERY_PARAM: &str = "_timeout";

/// Errors that take the gateway down.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Binding or serving the listener failed.
    #[error("http server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// Connected bus client used for request/reply.
    client: async_nats::Client,
    /// Request timeout when `_timeout` is absent.
    default_timeout: Duration,
}

impl GatewayState {
    /// Creates the gateway state.
    pub fn new(client: async_nats::Client, default_timeout: Duration) -> Self {
        GatewayState { client, default_timeout }
    }
}

/// Builds the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/{subject}", any(proxy_root))
        .route("/{subject}/{*suffix}", any(proxy_suffix))
        .fallback(malformed_url)
        .with_state(state)
}

/// Binds and serves the gateway until `token` is cancelled.
pub async fn run_gateway(
    state: GatewayState,
    port: u16,
    token: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting HTTP gateway");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}

async fn malformed_url() -> Response {
    (StatusCode::BAD_REQUEST, "URL should be in the pattern of /<subject>").into_response()
}

async fn proxy_root(
    State(state): State<GatewayState>,
    method: Method,
    Path(subject): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    proxy(state, method, subject, String::new(), params, body).await
}

async fn proxy_suffix(
    State(state): State<GatewayState>,
    method: Method,
    Path((subject, suffix)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    proxy(state, method, subject, format!("/{suffix}"), params, body).await
}

fn parse_timeout(raw: Option<&str>) -> Result<Option<Duration>, humantime::DurationError> {
    raw.map(humantime::parse_duration).transpose()
}

#[tracing::instrument(skip_all, fields(subject = %subject, method = %method))]
async fn proxy(
    state: GatewayState,
    method: Method,
    subject: String,
    url: String,
    params: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let timeout = match parse_timeout(params.get(TIMEOUT_QUERY_PARAM).map(String::as_str)) {
        Ok(timeout) => timeout.unwrap_or(state.default_timeout),
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid {TIMEOUT_QUERY_PARAM}: {e}"))
                .into_response()
        }
    };

    info!("received HTTP request");

    let message = Message {
        subject: subject.clone(),
        method: method.to_string(),
        url,
        payload: body.to_vec(),
        ..Message::default()
    };
    let payload = match serde_json::to_vec(&message) {
        Ok(payload) => payload,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode message: {e}"))
                .into_response()
        }
    };

    let mut headers = async_nats::HeaderMap::new();
    telemetry::inject_context(&mut headers);

    let request = async_nats::Request::new()
        .payload(payload.into())
        .headers(headers)
        .timeout(Some(timeout));

    let response = match state.client.send_request(subject, request).await {
        Ok(response) => response,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    let reply: Reply = match serde_json::from_slice(&response.payload) {
        Ok(reply) => reply,
        Err(e) => {
            return (StatusCode::FAILED_DEPENDENCY, format!("failed to decode reply: {e}"))
                .into_response()
        }
    };

    debug!(results = reply.results.len(), is_html = reply.is_html, "decoded bus reply");
    reply_to_response(reply)
}

/// Maps a decoded bus reply onto an HTTP response.
///
/// Dispatch-level errors map by class (404 for the no-script sentinel, 500
/// otherwise). The first HTML result wins outright, carrying its own status
/// and headers. Anything else is the results mapping as JSON — 500 when a
/// script failed (timeouts included), 200 otherwise.
fn reply_to_response(reply: Reply) -> Response {
    if !reply.error.is_empty() {
        let status = if reply.error == NO_SCRIPT_FOUND {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return (status, format!("Error: {}", reply.error)).into_response();
    }

    // First HTML result wins; pick by name so the choice is stable.
    let html = reply
        .results
        .iter()
        .filter(|(_, result)| result.is_html)
        .min_by_key(|(name, _)| name.clone());

    if let Some((_, result)) = html {
        let status =
            u16::try_from(result.code).ok().and_then(|c| StatusCode::from_u16(c).ok()).unwrap_or(StatusCode::OK);

        let mut headers = HeaderMap::new();
        for (key, value) in &result.headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str()))
            {
                headers.insert(name, value);
            }
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        }

        return (status, headers, result.payload.clone()).into_response();
    }

    let status = if reply.results.values().any(|r| !r.error.is_empty()) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    let body = serde_json::to_vec(&reply.results).unwrap_or_default();
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (status, headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;
    use crate::models::ScriptResult;

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[test]
    fn timeout_literals_parse() {
        assert_eq!(parse_timeout(Some("10s")).unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(parse_timeout(Some("250ms")).unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout(None).unwrap(), None);
        assert!(parse_timeout(Some("soon")).is_err());
    }

    #[tokio::test]
    async fn no_script_sentinel_maps_to_404() {
        let response = reply_to_response(Reply::from_error(NO_SCRIPT_FOUND));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_bytes(response).await;
        assert!(String::from_utf8_lossy(&body).contains(NO_SCRIPT_FOUND));
    }

    #[tokio::test]
    async fn other_dispatch_errors_map_to_500() {
        let response = reply_to_response(Reply::from_error("store exploded"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn html_result_wins_with_headers_and_status() {
        let mut results = StdHashMap::new();
        results.insert("plain".to_string(), ScriptResult::default());
        results.insert(
            "page".to_string(),
            ScriptResult {
                code: 201,
                is_html: true,
                payload: b"<h1>ok</h1>".to_vec(),
                headers: StdHashMap::from([("X-Src".to_string(), "t".to_string())]),
                ..ScriptResult::default()
            },
        );

        let response = reply_to_response(Reply::from_results(results));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("X-Src").unwrap(), "t");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(body_bytes(response).await, b"<h1>ok</h1>".to_vec());
    }

    #[tokio::test]
    async fn html_content_type_is_not_overridden_when_set() {
        let mut results = StdHashMap::new();
        results.insert(
            "page".to_string(),
            ScriptResult {
                code: 200,
                is_html: true,
                payload: b"{}".to_vec(),
                headers: StdHashMap::from([(
                    "Content-Type".to_string(),
                    "application/xhtml+xml".to_string(),
                )]),
                ..ScriptResult::default()
            },
        );

        let response = reply_to_response(Reply::from_results(results));
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/xhtml+xml");
    }

    #[tokio::test]
    async fn plain_results_serialize_as_json_200() {
        let mut results = StdHashMap::new();
        results.insert(
            "e1".to_string(),
            ScriptResult { payload: b"hi".to_vec(), ..ScriptResult::default() },
        );

        let response = reply_to_response(Reply::from_results(results));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");

        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body.get("e1").is_some());
    }

    #[tokio::test]
    async fn script_errors_surface_as_500_json() {
        let mut results = StdHashMap::new();
        results.insert("slow".to_string(), ScriptResult::from_error("script timed out"));

        let response = reply_to_response(Reply::from_results(results));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["slow"]["error"], "script timed out");
    }

    #[tokio::test]
    async fn empty_results_are_a_success() {
        let response = reply_to_response(Reply::from_results(StdHashMap::new()));
        assert_eq!(response.status(), StatusCode::OK);
    }
}
