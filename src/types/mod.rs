//! Common types shared by the dispatcher, manager, and backend workers.

use serde::{Deserialize, Serialize};

/// Backend server identifier. Assigned monotonically for the process
/// lifetime and never reused after retirement.
pub type ServerId = u64;

/// Telemetry body served by every backend at `GET /capacity-factor`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapacityFactorBody {
    pub capacity_factor: f64,
}

/// One entry of the control API's `GET /cache-servers` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub port: u16,
    #[serde(rename = "capacityFactor")]
    pub capacity_factor: f64,
    pub active: bool,
}

/// Response body of `POST /cache-servers`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartedServer {
    pub id: ServerId,
    pub port: u16,
}

/// The resource key of a request path: its final non-empty segment.
pub fn resource_key(path: &str) -> Option<&str> {
    path.split('/').rev().find(|segment| !segment.is_empty())
}
