//! Telemetry-driven ring reweighting.
//!
//! Each tick pulls the manager's fleet view, seeds angles for newcomers,
//! evicts vanished servers, and shifts each remaining server's angle count
//! one band step toward its observed load. Removals that would leave the
//! ring empty are skipped: a ring with a single overloaded server beats
//! dropping all traffic.

use crate::config::{BalancerConfig, RingConfig};
use crate::dispatcher::DispatcherState;
use crate::ring::HashRing;
use crate::types::ServerId;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Angles added per tick for a cold server (below cutoff c0).
const COLD_STEP: usize = 3;
/// Angles added or removed per tick in the adjacent bands.
const MILD_STEP: usize = 1;
/// Angles removed per tick for an overloaded server (above cutoff c3).
const HOT_STEP: usize = 3;

pub struct Redistributor {
    state: Arc<DispatcherState>,
    cutoffs: [f64; 4],
    initial_angles: usize,
    tick_interval: Duration,
}

impl Redistributor {
    pub fn new(state: Arc<DispatcherState>, balancer: &BalancerConfig, ring: &RingConfig) -> Self {
        Self {
            state,
            cutoffs: balancer.server_load_cutoffs,
            initial_angles: ring.initial_angles_per_server,
            tick_interval: balancer.redistribution_interval(),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("redistribution loop stopped");
    }

    /// One redistribution pass over the fleet.
    pub async fn tick(&self) {
        self.state.refresh_endpoints().await;
        let endpoints = self.state.endpoints.load_full();
        let ring = &self.state.ring;

        let on_ring: HashSet<ServerId> = ring.server_ids().into_iter().collect();

        for &id in endpoints.keys() {
            if !on_ring.contains(&id) {
                ring.add_server(id);
                if let Err(err) = ring.add_angle(id, self.initial_angles) {
                    warn!(server = id, %err, "failed to seed angles for new server");
                }
                debug!(server = id, angles = self.initial_angles, "server joined ring");
            }
        }

        for &id in &on_ring {
            if !endpoints.contains_key(&id) {
                if would_empty_ring(ring, id, ring.angle_count(id)) {
                    warn!(server = id, "keeping sole ring occupant despite retirement");
                    continue;
                }
                let removed = ring.remove_server(id);
                debug!(server = id, removed, "server left ring");
            }
        }

        for (&id, endpoint) in endpoints.iter() {
            // A server with no telemetry sample yet keeps its weight.
            let Some(cf) = endpoint.capacity_factor else {
                continue;
            };
            match angle_adjustment(cf, &self.cutoffs) {
                delta if delta > 0 => {
                    if let Err(err) = ring.add_angle(id, delta as usize) {
                        warn!(server = id, %err, "failed to add angles");
                    }
                },
                delta if delta < 0 => {
                    let count = (-delta) as usize;
                    if would_empty_ring(ring, id, count) {
                        debug!(server = id, "skipping removal that would empty the ring");
                        continue;
                    }
                    ring.remove_angle(id, count);
                },
                _ => {},
            }
        }

        ring.record_snapshot(Utc::now());
    }
}

/// The signed angle-count change for one server given its capacity factor,
/// against the ordered cutoffs [c0, c1, c2, c3].
pub(crate) fn angle_adjustment(cf: f64, cutoffs: &[f64; 4]) -> i32 {
    let [c0, c1, c2, c3] = *cutoffs;
    if cf < c0 {
        COLD_STEP as i32
    } else if cf < c1 {
        MILD_STEP as i32
    } else if cf <= c2 {
        0
    } else if cf <= c3 {
        -(MILD_STEP as i32)
    } else {
        -(HOT_STEP as i32)
    }
}

fn would_empty_ring(ring: &HashRing, id: ServerId, removing: usize) -> bool {
    let owned = ring.angle_count(id);
    removing >= owned && ring.total_angles() == owned
}
