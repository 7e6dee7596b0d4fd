//! Transparent HTTP proxy: catch-all dispatch to the least-loaded backend,
//! buffered for ordinary requests, chunked for the two streaming paths.
//!
//! The hardest correctness point lives here: `decrement_requests` must fire
//! exactly once per `increment_requests`, on every exit path — success,
//! upstream error, timeout, or client disconnect mid-stream. That contract
//! is expressed as an RAII guard (`ProxyGuard`) rather than duplicated at
//! each return site.

use std::sync::Arc;

use async_stream::stream;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;

use crate::registry::ServerState;
use crate::state::AppState;

/// Bound on how much of a client request body we buffer before forwarding.
/// Not a streaming-body policy — both dispatch modes fully read the inbound
/// body, matching the reference implementation — just a sanity ceiling.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// RAII guard for the increment/decrement contract around one dispatch.
/// `decrement_requests` runs in `Drop`, so it fires exactly once whether the
/// guard goes out of scope normally, via an early `return`, or because the
/// enclosing stream/future was dropped mid-poll (client disconnect).
struct ProxyGuard {
    state: Arc<AppState>,
    host: String,
    port: u16,
    mark_unhealthy: bool,
}

impl ProxyGuard {
    fn new(state: Arc<AppState>, host: String, port: u16) -> Self {
        Self {
            state,
            host,
            port,
            mark_unhealthy: false,
        }
    }

    fn fail(&mut self) {
        self.mark_unhealthy = true;
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        if self.mark_unhealthy {
            if let Err(e) = self.state.registry.mark_unhealthy(&self.host, self.port) {
                eprintln!("[proxy] {e} (programming error, ignoring)");
            }
        }
        if let Err(e) = self.state.registry.decrement_requests(&self.host, self.port) {
            eprintln!("[proxy] {e} (programming error, ignoring)");
        }
    }
}

fn is_streaming_path(path: &str) -> bool {
    path == "/api/generate" || path == "/api/chat"
}

fn build_upstream_url(host: &str, port: u16, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("http://{host}:{port}{path}?{q}"),
        _ => format!("http://{host}:{port}{path}"),
    }
}

fn no_healthy_servers() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(json!({ "detail": "No healthy servers available" })),
    )
        .into_response()
}

fn dispatch_error(detail: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(json!({ "detail": detail })),
    )
        .into_response()
}

/// Catch-all handler: any method, any path except the admin routes, which
/// are registered ahead of this fallback.
pub async fn catch_all(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|s| s.to_string());
    let method = parts.method.clone();
    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);

    let backend = match crate::selection::select_backend(&state.registry) {
        Some(b) => b,
        None => return no_healthy_servers(),
    };

    let url = build_upstream_url(&backend.host, backend.port, &path, query.as_deref());

    if let Err(e) = state.registry.increment_requests(&backend.host, backend.port) {
        eprintln!("[proxy] {e} (programming error, ignoring)");
    }

    if is_streaming_path(&path) {
        proxy_streaming(state, backend, method, url, headers, body).await
    } else {
        proxy_buffered(state, backend, method, url, headers, body).await
    }
}

async fn proxy_buffered(
    state: Arc<AppState>,
    backend: ServerState,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut guard = ProxyGuard::new(state.clone(), backend.host.clone(), backend.port);

    // A failure here is the client's malformed/truncated request body, not a
    // backend fault — decrement via the guard's Drop, but don't mark the
    // backend unhealthy for something it never saw.
    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return dispatch_error(&e.to_string());
        }
    };

    let result = state
        .http
        .request(method, &url)
        .headers(headers)
        .body(body_bytes)
        .timeout(state.config.request_timeout())
        .send()
        .await;

    match result {
        Ok(resp) => {
            let status = resp.status();
            let resp_headers = resp.headers().clone();
            match resp.bytes().await {
                Ok(bytes) => {
                    let mut response = Response::builder()
                        .status(status)
                        .body(Body::from(bytes))
                        .expect("status/body are always valid here");
                    *response.headers_mut() = resp_headers;
                    response
                }
                Err(e) => {
                    guard.fail();
                    dispatch_error(&e.to_string())
                }
            }
        }
        Err(e) => {
            guard.fail();
            dispatch_error(&e.to_string())
        }
    }
}

async fn proxy_streaming(
    state: Arc<AppState>,
    backend: ServerState,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut guard = ProxyGuard::new(state.clone(), backend.host.clone(), backend.port);

    // Same reasoning as the buffered path: a bad inbound body is the
    // client's fault, not the backend's.
    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return dispatch_error(&e.to_string());
        }
    };

    let result = state
        .http
        .request(method, &url)
        .headers(headers)
        .body(body_bytes)
        .timeout(state.config.request_timeout())
        .send()
        .await;

    match result {
        Ok(resp) => {
            let mut upstream = resp.bytes_stream();

            // `guard` moves into the generator: its Drop fires when the
            // stream is exhausted, breaks on error, or is dropped early by
            // the server framework because the client disconnected.
            let byte_stream = stream! {
                let mut guard = guard;
                while let Some(chunk) = upstream.next().await {
                    match chunk {
                        Ok(bytes) => yield Ok::<_, std::io::Error>(bytes),
                        Err(e) => {
                            eprintln!("[proxy] stream interrupted: {e}");
                            guard.fail();
                            break;
                        }
                    }
                }
            };

            // The upstream's connect-time status is not forwarded here —
            // matching the original's `StreamingResponse`, which always
            // answers 200 once the stream has started, regardless of what
            // status the backend reported on connect.
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(byte_stream))
                .expect("status/body are always valid here")
        }
        Err(e) => {
            guard.fail();
            dispatch_error(&e.to_string())
        }
    }
}
