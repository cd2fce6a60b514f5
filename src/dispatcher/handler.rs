//! Request forwarding for the client-facing listener.

use crate::dispatcher::DispatcherState;
use crate::error::DispatchError;
use crate::manager::Endpoint;
use crate::types::resource_key;
use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Map an inbound request to a backend by resource key and proxy it.
///
/// The resource key is the final non-empty path segment; the ring names the
/// owning server; the endpoint snapshot names its port. A missing endpoint
/// means we raced a redistribution tick, so the snapshot is refreshed once
/// before giving up with 503.
pub async fn forward(
    State(state): State<Arc<DispatcherState>>,
    request: Request,
) -> Result<Response, DispatchError> {
    let key = resource_key(request.uri().path())
        .ok_or(DispatchError::MissingKey)?
        .to_string();

    let id = state.ring.find_server_id(&key)?;

    let endpoint = match state.endpoints.load().get(&id) {
        Some(endpoint) => *endpoint,
        None => {
            state.refresh_endpoints().await;
            state.endpoints.load().get(&id).copied().ok_or_else(|| {
                DispatchError::NoBackend(format!("server {} has no live endpoint", id))
            })?
        },
    };
    debug_assert_ne!(endpoint.port, 0);

    debug!(%key, server = id, port = endpoint.port, "dispatching");
    proxy(&state, endpoint, request).await
}

async fn proxy(
    state: &DispatcherState,
    endpoint: Endpoint,
    request: Request,
) -> Result<Response, DispatchError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let url = format!("http://127.0.0.1:{}{}", endpoint.port, path_and_query);
    let method = request.method().clone();

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| DispatchError::Internal(format!("failed to read request body: {}", e)))?;

    let upstream = state
        .client
        .request(method, &url)
        .body(body)
        .send()
        .await
        .map_err(|e| DispatchError::Upstream(e.to_string()))?;

    let status = upstream.status();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| DispatchError::Upstream(e.to_string()))?;

    Ok((status, bytes).into_response())
}
