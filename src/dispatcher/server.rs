//! Balancer server wiring.
//!
//! Owns the shared state and the lifecycle of every worker: the
//! client-facing listener, the control API, the redistribution loop, the
//! modulation loop, the telemetry poller, and (through the manager) the
//! backend fleet. Teardown follows that order so in-flight requests drain
//! before the routing state underneath them is torn down.

use crate::config::{validation, Config};
use crate::dispatcher::handler::forward;
use crate::dispatcher::redistribution::Redistributor;
use crate::error::{Error, Result};
use crate::manager::{api, CacheServerManager, Endpoint};
use crate::monitor::ServerMonitor;
use crate::ring::HashRing;
use crate::types::ServerId;
use arc_swap::ArcSwap;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state behind every dispatcher handler.
pub struct DispatcherState {
    pub ring: Arc<HashRing>,
    pub manager: Arc<CacheServerManager>,
    /// Lock-free routing snapshot, replaced wholesale each redistribution
    /// tick.
    pub endpoints: ArcSwap<HashMap<ServerId, Endpoint>>,
    pub client: reqwest::Client,
}

impl DispatcherState {
    /// Replace the endpoint snapshot with the manager's current fleet view.
    pub async fn refresh_endpoints(&self) {
        let endpoints = self.manager.endpoints().await;
        self.endpoints.store(Arc::new(endpoints));
    }
}

pub struct BalancerServer {
    config: Arc<Config>,
    monitor: Arc<ServerMonitor>,
    manager: Arc<CacheServerManager>,
    state: Arc<DispatcherState>,
}

impl BalancerServer {
    pub fn new(config: Config) -> Result<Self> {
        validation::validate(&config)?;

        let monitor = Arc::new(ServerMonitor::new(&config.backend));
        let manager = Arc::new(CacheServerManager::new(&config, monitor.clone()));
        let ring = Arc::new(HashRing::new(
            config.ring.ring_size,
            config.ring.hash_algorithm,
            config.ring.angle_seed,
        ));

        let state = Arc::new(DispatcherState {
            ring,
            manager: manager.clone(),
            endpoints: ArcSwap::from_pointee(HashMap::new()),
            client: reqwest::Client::new(),
        });

        Ok(Self {
            config: Arc::new(config),
            monitor,
            manager,
            state,
        })
    }

    pub fn manager(&self) -> &Arc<CacheServerManager> {
        &self.manager
    }

    pub fn state(&self) -> &Arc<DispatcherState> {
        &self.state
    }

    /// The client-facing router: every method and path funnels into the
    /// forwarding handler.
    pub fn build_router(&self) -> Router {
        Router::new()
            .fallback(forward)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured client port and serve until the token fires.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.client_port)
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind: {}", e)))?;
        self.serve(listener, token).await
    }

    /// Start the fleet and every control worker, then serve client traffic
    /// on `listener` until `token` fires. Teardown order: client listener,
    /// redistribution, modulation, poller, backends.
    pub async fn serve(self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        self.manager.start_initial().await;

        let control_addr = api::serve(self.manager.clone(), token.child_token()).await?;
        info!(%control_addr, "fleet control API published");

        let redistributor = Redistributor::new(
            self.state.clone(),
            &self.config.balancer,
            &self.config.ring,
        );
        // Seed the ring before accepting traffic so the first request does
        // not race the first tick.
        redistributor.tick().await;

        let loops_token = CancellationToken::new();
        let redistribution_handle = tokio::spawn(redistributor.run(loops_token.clone()));
        let modulation_handle =
            tokio::spawn(self.manager.clone().run_modulation(loops_token.clone()));
        let poll_handle = tokio::spawn(self.monitor.clone().run_poll_loop(
            self.config.balancer.poll_interval(),
            loops_token.clone(),
        ));

        let addr = listener.local_addr()?;
        info!(%addr, "balancer accepting client traffic");

        let shutdown_token = token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await
            .map_err(|e| Error::Server(format!("Server error: {}", e)))?;

        info!("client listener closed, stopping workers");
        loops_token.cancel();
        let _ = redistribution_handle.await;
        let _ = modulation_handle.await;
        let _ = poll_handle.await;

        self.manager.shutdown().await;
        info!("balancer stopped");
        Ok(())
    }
}
