//! Helpers shared by the integration tests

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use syncstores::{ManualScheduler, MemStorage, Store, UpstreamSink};
use tokio::sync::mpsc;

/// Route `log` output through the test harness (`RUST_LOG=debug` to see it)
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sink writing into `area`, flushed by explicit ticks
pub fn manual_sink(area: &Arc<MemStorage>) -> (Arc<UpstreamSink>, Arc<ManualScheduler>) {
    let scheduler = Arc::new(ManualScheduler::new());
    let sink = UpstreamSink::for_area(area.clone(), scheduler.clone());
    (Arc::new(sink), scheduler)
}

/// Wait until `store` holds `expected`
///
/// # Panics
/// Panics if it does not happen within a few seconds.
pub async fn wait_for(store: &Store, expected: Option<Value>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = store.subscribe(move |value| {
        let _ = tx.send(value.cloned());
    });
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(value) = rx.recv().await {
            if value == expected {
                return;
            }
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "store '{}' never reached {expected:?}, has {:?}",
        store.key(),
        store.get()
    );
}

/// Let every deferred task and the live listener run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
