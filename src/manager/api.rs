//! Control API for the backend fleet.
//!
//! Bound to an ephemeral loopback port and published to the dispatcher at
//! startup. Exposes the manager's start/stop operations and the monitor's
//! view of the fleet.

use crate::error::Error;
use crate::manager::CacheServerManager;
use crate::types::{ServerEntry, ServerId, StartedServer};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(manager: Arc<CacheServerManager>) -> Router {
    Router::new()
        .route("/cache-servers", get(list_servers).post(start_server))
        .route("/cache-servers/:id", delete(stop_server))
        .with_state(manager)
}

/// Bind the control API to an ephemeral loopback port and serve it until
/// the token fires. Returns the bound address.
pub async fn serve(
    manager: Arc<CacheServerManager>,
    token: CancellationToken,
) -> crate::error::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Server(format!("control API failed to bind: {}", e)))?;
    let addr = listener.local_addr()?;
    let app = router(manager);

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(%e, "control API server error");
        }
    });

    info!(%addr, "control API listening");
    Ok(addr)
}

/// `GET /cache-servers`: the currently tracked fleet, keyed by decimal id.
async fn list_servers(
    State(manager): State<Arc<CacheServerManager>>,
) -> Json<HashMap<String, ServerEntry>> {
    let mut listing = HashMap::new();
    for (id, endpoint) in manager.endpoints().await {
        let active = manager.monitor().get(id).map_or(false, |info| info.active);
        listing.insert(
            id.to_string(),
            ServerEntry {
                port: endpoint.port,
                capacity_factor: endpoint.capacity_factor.unwrap_or(0.0),
                active,
            },
        );
    }
    Json(listing)
}

/// `POST /cache-servers`: start one backend.
async fn start_server(
    State(manager): State<Arc<CacheServerManager>>,
) -> Result<Json<StartedServer>, Response> {
    manager
        .start_backend()
        .await
        .map(Json)
        .map_err(|err| {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.to_string()).into_response()
        })
}

/// `DELETE /cache-servers/{id}`: stop one backend. 404 when unknown.
async fn stop_server(
    State(manager): State<Arc<CacheServerManager>>,
    Path(id): Path<ServerId>,
) -> Response {
    match manager.stop_backend(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(Error::UnknownServer(_)) => {
            (StatusCode::NOT_FOUND, format!("unknown server: {}", id)).into_response()
        },
        Err(err) => {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.to_string()).into_response()
        },
    }
}
