//! Cache-server manager: backend lifecycle plus the autoscaling loop.
//!
//! The manager exclusively owns the server table and the free-port set.
//! Every start and stop runs under one manager-wide async lock, so the
//! table never sees concurrent mutation. The modulation loop nudges the
//! fleet size each tick so the mean capacity factor tracks the target.

pub mod api;

use crate::backend::CacheServer;
use crate::config::{BalancerConfig, BackendConfig, Config};
use crate::error::{Error, Result};
use crate::monitor::ServerMonitor;
use crate::types::{ServerId, StartedServer};
use chrono::Utc;
use futures::future::join_all;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routing view of one live backend, consumed by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub port: u16,
    pub capacity_factor: Option<f64>,
}

struct BackendHandle {
    port: u16,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct ManagerState {
    free_ports: BTreeSet<u16>,
    server_table: HashMap<ServerId, BackendHandle>,
}

pub struct CacheServerManager {
    monitor: Arc<ServerMonitor>,
    balancer_cfg: BalancerConfig,
    backend_cfg: BackendConfig,
    id_counter: AtomicU64,
    state: Mutex<ManagerState>,
}

impl CacheServerManager {
    pub fn new(config: &Config, monitor: Arc<ServerMonitor>) -> Self {
        Self {
            monitor,
            balancer_cfg: config.balancer.clone(),
            backend_cfg: config.backend.clone(),
            id_counter: AtomicU64::new(0),
            state: Mutex::new(ManagerState {
                free_ports: config.backend.port_range().collect(),
                server_table: HashMap::new(),
            }),
        }
    }

    pub fn monitor(&self) -> &Arc<ServerMonitor> {
        &self.monitor
    }

    /// Bring up the configured initial fleet. Individual failures are
    /// logged and skipped; the modulation loop will make up the shortfall.
    pub async fn start_initial(&self) {
        let want = self.balancer_cfg.initial_backend_count;
        for _ in 0..want {
            match self.start_backend().await {
                Ok(_) => {},
                Err(Error::NoFreePort) => {
                    warn!("port range exhausted before initial fleet was complete");
                    break;
                },
                Err(err) => warn!(%err, "initial backend start failed"),
            }
        }
        let active = self.active_count().await;
        info!(active, "initial fleet started");
    }

    /// Start one backend: allocate a port, spawn the worker, wait for its
    /// readiness signal, register it with the monitor. A start that times
    /// out releases the port.
    pub async fn start_backend(&self) -> Result<StartedServer> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    async fn start_locked(&self, state: &mut ManagerState) -> Result<StartedServer> {
        let port = match state.free_ports.iter().next().copied() {
            Some(port) => {
                state.free_ports.remove(&port);
                port
            },
            None => return Err(Error::NoFreePort),
        };
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = CacheServer::new(id, port, self.backend_cfg.record_window());
        let worker_token = token.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = worker.run(ready_tx, worker_token).await {
                error!(backend = id, %err, "backend worker failed");
            }
        });

        // A dropped sender (bind failure) and a slow bind both land here.
        let ready = timeout(self.backend_cfg.startup_timeout(), ready_rx).await;
        if !matches!(ready, Ok(Ok(_))) {
            token.cancel();
            task.abort();
            state.free_ports.insert(port);
            return Err(Error::BackendStartTimeout(
                id,
                self.backend_cfg.startup_timeout_ms,
            ));
        }

        if let Err(err) = self.monitor.add_server(id, port, Utc::now()) {
            token.cancel();
            task.abort();
            state.free_ports.insert(port);
            return Err(err);
        }
        state.server_table.insert(id, BackendHandle { port, token, task });
        info!(backend = id, port, "backend started");
        Ok(StartedServer { id, port })
    }

    /// Stop a specific backend. The port returns to the free set only once
    /// the worker has exited (or was force-killed after the grace period).
    pub async fn stop_backend(&self, id: ServerId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state, id).await
    }

    /// Stop one backend chosen uniformly at random from the active set.
    pub async fn stop_random_backend(&self) -> Result<ServerId> {
        let mut state = self.state.lock().await;
        let id = state
            .server_table
            .keys()
            .copied()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::Server("no active backends to stop".to_string()))?;
        self.stop_locked(&mut state, id).await?;
        Ok(id)
    }

    async fn stop_locked(&self, state: &mut ManagerState, id: ServerId) -> Result<()> {
        let handle = state.server_table.remove(&id).ok_or(Error::UnknownServer(id))?;
        handle.token.cancel();

        let mut task = handle.task;
        if timeout(self.backend_cfg.shutdown_grace(), &mut task).await.is_err() {
            warn!(
                backend = id,
                grace_ms = self.backend_cfg.shutdown_grace_ms,
                "backend did not stop within grace period, aborting"
            );
            task.abort();
        }

        state.free_ports.insert(handle.port);
        self.monitor.deactivate_server(id, Utc::now())?;
        info!(backend = id, port = handle.port, "backend stopped");
        Ok(())
    }

    /// One autoscaling step: compare the fleet's mean capacity factor to
    /// the target and start or stop `round(diff * growth_rate)` backends.
    /// The fleet never shrinks below one backend.
    pub async fn modulate_once(&self) {
        let avg = self.monitor.average_capacity_factor();
        let diff = avg - self.balancer_cfg.target_cf;
        let delta = (diff * self.balancer_cfg.growth_rate).round() as i64;
        debug!(avg, diff, delta, "modulation tick");

        if delta > 0 {
            for _ in 0..delta {
                match self.start_backend().await {
                    Ok(started) => debug!(backend = started.id, "scaled up"),
                    Err(err) => {
                        warn!(%err, "scale-up start failed, retrying next tick");
                        break;
                    },
                }
            }
        } else if delta < 0 {
            let active = self.active_count().await;
            let to_stop = (-delta as usize).min(active.saturating_sub(1));
            for _ in 0..to_stop {
                match self.stop_random_backend().await {
                    Ok(id) => debug!(backend = id, "scaled down"),
                    Err(err) => {
                        warn!(%err, "scale-down stop failed, retrying next tick");
                        break;
                    },
                }
            }
        }

        let count = self.active_count().await;
        self.monitor.update_server_count(Utc::now().timestamp(), count);
    }

    /// Periodic modulation until the token is cancelled.
    pub async fn run_modulation(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(self.balancer_cfg.modulation_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.modulate_once().await,
            }
        }
        debug!("modulation loop stopped");
    }

    /// Routing view of the live fleet: port and latest capacity factor per
    /// tracked backend.
    pub async fn endpoints(&self) -> HashMap<ServerId, Endpoint> {
        let state = self.state.lock().await;
        state
            .server_table
            .iter()
            .map(|(id, handle)| {
                let capacity_factor =
                    self.monitor.get(*id).and_then(|info| info.current_capacity_factor);
                (
                    *id,
                    Endpoint {
                        port: handle.port,
                        capacity_factor,
                    },
                )
            })
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.server_table.len()
    }

    pub async fn active_ids(&self) -> Vec<ServerId> {
        self.state.lock().await.server_table.keys().copied().collect()
    }

    pub async fn free_port_count(&self) -> usize {
        self.state.lock().await.free_ports.len()
    }

    /// Stop every backend in parallel and join them, returning their ports
    /// to the free set.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let grace = self.backend_cfg.shutdown_grace();
        let handles: Vec<(ServerId, BackendHandle)> = state.server_table.drain().collect();

        let stops = handles.into_iter().map(|(id, handle)| async move {
            handle.token.cancel();
            let mut task = handle.task;
            if timeout(grace, &mut task).await.is_err() {
                warn!(backend = id, "force-killing backend at shutdown");
                task.abort();
            }
            (id, handle.port)
        });

        for (id, port) in join_all(stops).await {
            state.free_ports.insert(port);
            if let Err(err) = self.monitor.deactivate_server(id, Utc::now()) {
                debug!(backend = id, %err, "monitor entry missing at shutdown");
            }
        }
        info!("all backends stopped");
    }
}
