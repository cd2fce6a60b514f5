//! Common test utilities for integration tests

use cachefleet::config::Config;
use cachefleet::dispatcher::BalancerServer;
use cachefleet::ring::HashRing;
use cachefleet::types::ServerId;
use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Create a test configuration over a private backend port range. Tests
/// run in parallel, so every test must use its own range.
#[allow(dead_code)]
pub fn test_config(port_start: u16, port_end: u16, initial_backends: usize) -> Config {
    let mut config = Config::default();
    config.backend.port_range_start = port_start;
    config.backend.port_range_end = port_end;
    config.balancer.initial_backend_count = initial_backends;

    // Polling and modulation are effectively disabled so the ring stays
    // stable mid-test; tests drive ping_all and modulate_once by hand.
    config.balancer.poll_interval_ms = 60_000;
    config.balancer.modulation_interval_ms = 60_000;
    config.balancer.redistribution_interval_ms = 100;
    config.backend.startup_timeout_ms = 2000;
    config.backend.shutdown_grace_ms = 1000;
    config
}

/// A balancer running on an ephemeral client port.
pub struct TestBalancer {
    pub addr: SocketAddr,
    pub token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
pub async fn start_test_balancer(config: Config) -> TestBalancer {
    let server = BalancerServer::new(config).expect("invalid test config");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().expect("failed to get local addr");

    let token = CancellationToken::new();
    let serve_token = token.clone();
    let handle = tokio::spawn(async move {
        server.serve(listener, serve_token).await.expect("balancer failed");
    });

    // Give the fleet and the first redistribution tick time to come up.
    tokio::time::sleep(Duration::from_millis(500)).await;

    TestBalancer {
        addr,
        token,
        handle,
    }
}

impl TestBalancer {
    #[allow(dead_code)]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Orderly teardown; waits for the fleet to stop.
    #[allow(dead_code)]
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for TestBalancer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Create a test HTTP client
#[allow(dead_code)]
pub fn test_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create client")
}

/// Find a key the ring currently maps to `id`.
#[allow(dead_code)]
pub fn key_owned_by(ring: &HashRing, id: ServerId) -> String {
    for i in 0..100_000u32 {
        let key = format!("key-{}", i);
        if ring.find_server_id(&key).ok() == Some(id) {
            return key;
        }
    }
    panic!("no key found mapping to server {}", id);
}
