//! Startup validation of configuration invariants.
//!
//! Every rule here guards an assumption the runtime relies on without
//! re-checking: the ring masks positions with `ring_size - 1`, the
//! redistribution loop indexes the cutoff bands in order, and the manager
//! allocates ports straight out of the configured range.

use crate::config::Config;
use crate::error::{Error, Result};

/// Minimum ring size: 2^14.
const MIN_RING_SIZE: u32 = 1 << 14;

pub fn validate(config: &Config) -> Result<()> {
    let balancer = &config.balancer;

    if !balancer.target_cf.is_finite() || balancer.target_cf <= 0.0 {
        return Err(Error::Config(format!(
            "target_cf must be a positive number, got {}",
            balancer.target_cf
        )));
    }

    if !balancer.growth_rate.is_finite() || balancer.growth_rate <= 0.0 {
        return Err(Error::Config(format!(
            "growth_rate must be a positive number, got {}",
            balancer.growth_rate
        )));
    }

    let cutoffs = &balancer.server_load_cutoffs;
    if cutoffs.iter().any(|c| !c.is_finite() || *c < 0.0) {
        return Err(Error::Config(format!(
            "server_load_cutoffs must be non-negative numbers, got {:?}",
            cutoffs
        )));
    }
    if !cutoffs.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(Error::Config(format!(
            "server_load_cutoffs must be strictly increasing, got {:?}",
            cutoffs
        )));
    }

    for (name, value) in [
        ("modulation_interval_ms", balancer.modulation_interval_ms),
        (
            "redistribution_interval_ms",
            balancer.redistribution_interval_ms,
        ),
        ("poll_interval_ms", balancer.poll_interval_ms),
    ] {
        if value == 0 {
            return Err(Error::Config(format!("{} must be positive", name)));
        }
    }

    let ring = &config.ring;
    if !ring.ring_size.is_power_of_two() || ring.ring_size < MIN_RING_SIZE {
        return Err(Error::Config(format!(
            "ring_size must be a power of two >= {}, got {}",
            MIN_RING_SIZE, ring.ring_size
        )));
    }
    if ring.initial_angles_per_server == 0 {
        return Err(Error::Config(
            "initial_angles_per_server must be at least 1".to_string(),
        ));
    }

    let backend = &config.backend;
    if backend.port_range_start >= backend.port_range_end {
        return Err(Error::Config(format!(
            "selectable port range [{}, {}) is empty",
            backend.port_range_start, backend.port_range_end
        )));
    }

    let range_len = usize::from(backend.port_range_end - backend.port_range_start);
    if balancer.initial_backend_count > range_len {
        return Err(Error::Config(format!(
            "initial_backend_count {} exceeds the {} selectable ports",
            balancer.initial_backend_count, range_len
        )));
    }

    Ok(())
}
