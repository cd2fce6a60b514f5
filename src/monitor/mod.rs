//! Telemetry collection for the backend fleet.
//!
//! The monitor owns the table of known backends, polls each active one for
//! its capacity factor, and exposes the aggregates the autoscaler and the
//! redistribution loop consume. Table membership is mutated only by the
//! manager; the monitor itself touches nothing but per-server telemetry
//! fields, and does so through the map's per-entry lock so readers always
//! see a consistent `(current_capacity_factor, active)` pair.

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::types::{CapacityFactorBody, ServerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-backend record kept for the process lifetime. Deactivated servers
/// are retained for reporting, never deleted.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: ServerId,
    pub port: u16,
    pub start_time: DateTime<Utc>,
    pub deactivation_time: Option<DateTime<Utc>>,
    pub active: bool,
    /// Most recent sample. `None` until the first successful poll; a poll
    /// reporting 0.0 is a real sample, not a missing one.
    pub current_capacity_factor: Option<f64>,
    /// Time-ordered sample history, appended on every successful poll.
    pub capacity_factor_record: BTreeMap<DateTime<Utc>, f64>,
}

pub struct ServerMonitor {
    servers: DashMap<ServerId, ServerInfo>,
    /// Active-server count per second, first-write-wins per key.
    server_counts: Mutex<BTreeMap<i64, usize>>,
    client: reqwest::Client,
    telemetry_timeout: Duration,
}

impl ServerMonitor {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            servers: DashMap::new(),
            server_counts: Mutex::new(BTreeMap::new()),
            client: reqwest::Client::new(),
            telemetry_timeout: config.telemetry_timeout(),
        }
    }

    /// Insert a freshly started backend. `DuplicateId` if the id is already
    /// tracked; ids are never reused, so a duplicate is a programmer error.
    pub fn add_server(&self, id: ServerId, port: u16, now: DateTime<Utc>) -> Result<()> {
        if self.servers.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        self.servers.insert(
            id,
            ServerInfo {
                id,
                port,
                start_time: now,
                deactivation_time: None,
                active: true,
                current_capacity_factor: None,
                capacity_factor_record: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Mark a backend inactive. Idempotent when already inactive.
    pub fn deactivate_server(&self, id: ServerId, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.servers.get_mut(&id).ok_or(Error::UnknownServer(id))?;
        if entry.active {
            entry.active = false;
            entry.deactivation_time = Some(now);
        }
        Ok(())
    }

    /// Record one successful telemetry sample. The current value and the
    /// history append happen under the entry lock, so no reader observes a
    /// stale value paired with a newer record.
    pub fn record_sample(&self, id: ServerId, value: f64, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.servers.get_mut(&id).ok_or(Error::UnknownServer(id))?;
        entry.current_capacity_factor = Some(value);
        entry.capacity_factor_record.insert(now, value);
        Ok(())
    }

    /// Poll every active backend once, in parallel. Each poll is
    /// independent: a failure is logged and dropped without touching the
    /// stored capacity factor for that server.
    pub async fn ping_all(&self) {
        let targets: Vec<(ServerId, u16)> = self
            .servers
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| (entry.id, entry.port))
            .collect();

        let polls = targets.into_iter().map(|(id, port)| {
            let client = self.client.clone();
            let timeout = self.telemetry_timeout;
            async move {
                let result = poll_backend(&client, port, timeout)
                    .await
                    .map_err(|e| Error::Telemetry(id, e.to_string()));
                (id, result)
            }
        });

        for (id, result) in futures::future::join_all(polls).await {
            match result {
                Ok(value) => {
                    debug!(server = id, capacity_factor = value, "telemetry sample");
                    // The server may have been retired mid-poll; drop the
                    // sample in that case.
                    if let Err(err) = self.record_sample(id, value, Utc::now()) {
                        debug!(server = id, %err, "dropping sample for retired server");
                    }
                },
                Err(err) => {
                    warn!(server = id, %err, "telemetry poll failed");
                },
            }
        }
    }

    /// Periodic polling until the token is cancelled.
    pub async fn run_poll_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        token: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.ping_all().await,
            }
        }
        debug!("telemetry poll loop stopped");
    }

    /// Record the active-server count for one wall-clock second. The first
    /// write for a given second wins.
    pub fn update_server_count(&self, second: i64, count: usize) {
        self.server_counts.lock().entry(second).or_insert(count);
    }

    /// Mean of the current capacity factor over active servers with a
    /// strictly positive sample. 0.0 when none qualify.
    pub fn average_capacity_factor(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for entry in self.servers.iter() {
            if !entry.active {
                continue;
            }
            match entry.current_capacity_factor {
                Some(value) if value > 0.0 => {
                    sum += value;
                    count += 1;
                },
                _ => {},
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    pub fn active_count(&self) -> usize {
        self.servers.iter().filter(|entry| entry.active).count()
    }

    /// Deep copy of the server table for external read-only use.
    pub fn snapshot(&self) -> Vec<ServerInfo> {
        self.servers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get(&self, id: ServerId) -> Option<ServerInfo> {
        self.servers.get(&id).map(|entry| entry.value().clone())
    }

    /// Copy of the per-second active-count history.
    pub fn server_counts(&self) -> BTreeMap<i64, usize> {
        self.server_counts.lock().clone()
    }
}

async fn poll_backend(client: &reqwest::Client, port: u16, timeout: Duration) -> Result<f64> {
    let url = format!("http://127.0.0.1:{}/capacity-factor", port);
    let response = client.get(&url).timeout(timeout).send().await?;
    let response = response.error_for_status()?;
    let body: CapacityFactorBody = response.json().await?;
    Ok(body.capacity_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ServerMonitor {
        ServerMonitor::new(&BackendConfig::default())
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let monitor = monitor();
        monitor.add_server(1, 37100, Utc::now()).unwrap();
        assert!(matches!(
            monitor.add_server(1, 37101, Utc::now()),
            Err(Error::DuplicateId(1))
        ));
    }

    #[test]
    fn deactivation_is_idempotent_and_keeps_first_timestamp() {
        let monitor = monitor();
        monitor.add_server(1, 37100, Utc::now()).unwrap();

        let first = Utc::now();
        monitor.deactivate_server(1, first).unwrap();
        monitor
            .deactivate_server(1, first + chrono::Duration::seconds(5))
            .unwrap();

        let info = monitor.get(1).unwrap();
        assert!(!info.active);
        assert_eq!(info.deactivation_time, Some(first));
    }

    #[test]
    fn unknown_server_is_an_error() {
        let monitor = monitor();
        assert!(matches!(
            monitor.deactivate_server(9, Utc::now()),
            Err(Error::UnknownServer(9))
        ));
        assert!(matches!(
            monitor.record_sample(9, 0.5, Utc::now()),
            Err(Error::UnknownServer(9))
        ));
    }

    #[test]
    fn average_ignores_inactive_unsampled_and_zero() {
        let monitor = monitor();
        let now = Utc::now();
        for id in 1..=4 {
            monitor.add_server(id, 37100 + id as u16, now).unwrap();
        }

        monitor.record_sample(1, 0.6, now).unwrap();
        monitor.record_sample(2, 0.2, now).unwrap();
        monitor.record_sample(3, 0.0, now).unwrap(); // real sample, excluded from mean
        // 4 has no sample at all
        monitor.record_sample(1, 0.8, now + chrono::Duration::seconds(1)).unwrap();

        let avg = monitor.average_capacity_factor();
        assert!((avg - 0.5).abs() < 1e-9, "avg was {}", avg);

        monitor.deactivate_server(1, now + chrono::Duration::seconds(2)).unwrap();
        assert!((monitor.average_capacity_factor() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn average_is_zero_when_nothing_qualifies() {
        let monitor = monitor();
        assert_eq!(monitor.average_capacity_factor(), 0.0);

        monitor.add_server(1, 37100, Utc::now()).unwrap();
        monitor.record_sample(1, 0.0, Utc::now()).unwrap();
        assert_eq!(monitor.average_capacity_factor(), 0.0);
    }

    #[test]
    fn sample_updates_current_and_appends_record() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.add_server(1, 37100, now).unwrap();
        monitor.record_sample(1, 0.3, now).unwrap();
        monitor.record_sample(1, 0.9, now + chrono::Duration::seconds(1)).unwrap();

        let info = monitor.get(1).unwrap();
        assert_eq!(info.current_capacity_factor, Some(0.9));
        assert_eq!(info.capacity_factor_record.len(), 2);
        assert_eq!(*info.capacity_factor_record.values().last().unwrap(), 0.9);
    }

    #[test]
    fn server_count_is_first_write_wins() {
        let monitor = monitor();
        monitor.update_server_count(100, 5);
        monitor.update_server_count(100, 9);
        monitor.update_server_count(101, 6);

        let counts = monitor.server_counts();
        assert_eq!(counts.get(&100), Some(&5));
        assert_eq!(counts.get(&101), Some(&6));
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let monitor = monitor();
        monitor.add_server(1, 37100, Utc::now()).unwrap();
        let snapshot = monitor.snapshot();

        monitor.record_sample(1, 0.7, Utc::now()).unwrap();
        assert_eq!(snapshot[0].current_capacity_factor, None);
    }
}
