//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Route driver logs to the test harness (`RUST_LOG=debug` to see them)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
