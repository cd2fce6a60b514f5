//! Backend cache-server worker.
//!
//! Each backend is a tokio task owning its own loopback listener. It serves
//! opaque resources keyed by the final path segment, answers the telemetry
//! probe at `GET /capacity-factor`, and reports readiness over a oneshot
//! once its listener is bound, so the manager never has to poll for the
//! port to come up.

pub mod load;

pub use load::LoadTracker;

use crate::error::{Error, Result};
use crate::types::{resource_key, CapacityFactorBody, ServerId};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct CacheServer {
    id: ServerId,
    port: u16,
    record_window: Duration,
}

struct BackendState {
    id: ServerId,
    store: DashMap<String, Bytes>,
    tracker: LoadTracker,
}

impl CacheServer {
    pub fn new(id: ServerId, port: u16, record_window: Duration) -> Self {
        Self {
            id,
            port,
            record_window,
        }
    }

    /// Bind, signal readiness with the bound address, then serve until the
    /// cancellation token fires.
    pub async fn run(
        self,
        ready: oneshot::Sender<SocketAddr>,
        token: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|e| Error::Server(format!("backend {} failed to bind: {}", self.id, e)))?;
        let addr = listener.local_addr()?;

        let state = Arc::new(BackendState {
            id: self.id,
            store: DashMap::new(),
            tracker: LoadTracker::new(self.record_window),
        });
        let router = build_router(state);

        info!(backend = self.id, %addr, "cache server listening");
        // The manager may have given up waiting; serve anyway, it will
        // cancel us.
        let _ = ready.send(addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .map_err(|e| Error::Server(format!("backend {} server error: {}", self.id, e)))?;

        info!(backend = self.id, "cache server stopped");
        Ok(())
    }
}

fn build_router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/capacity-factor", get(capacity_factor))
        .fallback(handle_resource)
        .with_state(state)
}

/// Telemetry probe. Not counted as cache work.
async fn capacity_factor(State(state): State<Arc<BackendState>>) -> Json<CapacityFactorBody> {
    Json(CapacityFactorBody {
        capacity_factor: state.tracker.capacity_factor(),
    })
}

async fn handle_resource(State(state): State<Arc<BackendState>>, request: Request) -> Response {
    let started = Instant::now();

    let key = match resource_key(request.uri().path()) {
        Some(key) => key.to_string(),
        None => {
            return (StatusCode::BAD_REQUEST, "missing resource key").into_response();
        },
    };

    let method = request.method().clone();
    let response = if method == Method::GET || method == Method::HEAD {
        let body = state.store.entry(key.clone()).or_insert_with(|| {
            // First touch materializes a placeholder; the balancer only
            // cares that the key is consistently owned here.
            Bytes::from(format!("resource {} served by backend {}", key, state.id))
        });
        body.value().clone().into_response()
    } else if method == Method::PUT || method == Method::POST {
        match axum::body::to_bytes(request.into_body(), usize::MAX).await {
            Ok(bytes) => {
                state.store.insert(key.clone(), bytes);
                StatusCode::NO_CONTENT.into_response()
            },
            Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    } else if method == Method::DELETE {
        state.store.remove(&key);
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    };

    debug!(backend = state.id, %key, %method, "served resource");
    state.tracker.record(started.elapsed());
    response
}
