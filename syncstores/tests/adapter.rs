//! Store groups over in-memory areas, driven by the tokio runtime

#[macro_use]
extern crate hamcrest;
use hamcrest::prelude::*;

mod common;

use common::{settle, wait_for};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use syncstores::{
    AdapterConfig, AdapterError, Batch, FaultChannel, Items, KeySelection, MemStorage,
    StorageAdapter, StorageArea, StorageError, StorageNamespace, WriteHandle,
};
use syncstores::storage::CHANGE_FEED_CAPACITY;

fn items(pairs: &[(&str, Value)]) -> Items {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn seeded(pairs: &[(&str, Value)]) -> Arc<MemStorage> {
    common::init_logging();
    Arc::new(MemStorage::new().with_items(items(pairs)))
}

// ----------------------------------------------------------------------------
// Fixed keys
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_default_then_loaded_then_removed() {
    let area = seeded(&[("count", json!(5))]);
    let group = StorageAdapter::new(area.clone())
        .open([("count", json!(0))])
        .unwrap();
    let count = group.store("count").unwrap();
    assert_that!(count.get(), is(equal_to(Some(json!(0)))));

    let loaded = group.ready().await.unwrap();
    assert_that!(loaded, is(equal_to(true)));
    assert_that!(count.get(), is(equal_to(Some(json!(5)))));

    area.remove("count").await.unwrap();
    wait_for(&count, Some(json!(0))).await;
    assert_that!(area.writes().len(), is(equal_to(0)));
}

#[tokio::test]
async fn test_undeclared_keys_are_absent() {
    let area = seeded(&[("other", json!(1))]);
    let group = StorageAdapter::new(area.clone()).open(["a", "b"]).unwrap();
    group.ready().await.unwrap();

    assert!(group.store("other").is_none());
    assert_that!(group.stores().keys(), is(equal_to(vec!["a".to_string(), "b".to_string()])));
    assert_that!(group.store("a").unwrap().get(), is(equal_to(None)));

    area.set(items(&[("other", json!(2))])).await.unwrap();
    settle().await;
    assert!(group.store("other").is_none());
}

#[tokio::test]
async fn test_writes_in_one_tick_are_one_request() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone()).open(["a", "b"]).unwrap();
    group.ready().await.unwrap();

    let handles: Arc<Mutex<Vec<(WriteHandle, Batch)>>> = Arc::default();
    let seen = Arc::clone(&handles);
    let _observer = group.on_write(move |handle, batch| {
        seen.lock().push((handle, batch.clone()));
    });

    group.store("a").unwrap().set(json!(1));
    group.store("b").unwrap().set(json!(2));
    settle().await;

    let expected = items(&[("a", json!(1)), ("b", json!(2))]);
    assert_that!(area.writes(), is(equal_to(vec![expected.clone()])));

    let observed = handles.lock().clone();
    assert_that!(observed.len(), is(equal_to(1)));
    let (handle, batch) = observed.into_iter().next().unwrap();
    assert_that!(batch, is(equal_to(expected)));
    assert_that!(handle.await, is(equal_to(Ok(()))));
}

#[tokio::test]
async fn test_echo_of_own_write_is_not_written_again() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();
    group.ready().await.unwrap();

    let store = group.store("k").unwrap();
    store.set(json!({"nested": [1, 2]}));
    settle().await;
    settle().await;

    assert_that!(area.writes().len(), is(equal_to(1)));
    assert_that!(store.get(), is(equal_to(Some(json!({"nested": [1, 2]})))));
}

#[tokio::test]
async fn test_ready_fails_with_request_error() {
    let area = seeded(&[]);
    area.fail_next_get(StorageError::Backend("quota".into()), FaultChannel::Result);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();

    let result = group.ready().await;
    assert_that!(result, is(equal_to(Err(StorageError::Backend("quota".into())))));
    assert_that!(group.ready().peek(), is(equal_to(Some(Err(StorageError::Backend("quota".into()))))));
}

#[tokio::test]
async fn test_ready_fails_with_last_error() {
    let area = seeded(&[("k", json!(1))]);
    area.fail_next_get(StorageError::Disconnected, FaultChannel::LastError);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();

    let result = group.ready().await;
    assert_that!(result, is(equal_to(Err(StorageError::Disconnected))));
    assert_that!(group.store("k").unwrap().get(), is(equal_to(None)));
}

#[tokio::test]
async fn test_set_error_callback() {
    let area = seeded(&[]);
    let failures: Arc<Mutex<Vec<(StorageError, Batch)>>> = Arc::default();
    let seen = Arc::clone(&failures);
    let group = StorageAdapter::new(area.clone())
        .on_set_error(move |e, batch| seen.lock().push((e.clone(), batch.clone())))
        .open("k")
        .unwrap();
    group.ready().await.unwrap();

    area.fail_next_set(StorageError::Backend("full".into()), FaultChannel::LastError);
    group.store("k").unwrap().set(json!("v"));
    settle().await;

    let failures = failures.lock().clone();
    assert_that!(failures.len(), is(equal_to(1)));
    let expected_err = StorageError::Backend("full".into());
    let expected_batch = items(&[("k", json!("v"))]);
    assert_that!(&failures[0].0, is(equal_to(&expected_err)));
    assert_that!(&failures[0].1, is(equal_to(&expected_batch)));
    assert!(area.items().is_empty());
    // The store keeps the local value
    assert_that!(group.store("k").unwrap().get(), is(equal_to(Some(json!("v")))));
}

// ----------------------------------------------------------------------------
// Live updates
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_live_through_own_feed() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();
    group.ready().await.unwrap();
    assert!(group.is_live());

    area.set(items(&[("k", json!("remote"))])).await.unwrap();
    wait_for(&group.store("k").unwrap(), Some(json!("remote"))).await;
    assert_that!(area.writes().len(), is(equal_to(1)));
}

#[tokio::test]
async fn test_live_through_namespace_feed() {
    common::init_logging();
    let mut namespace = StorageNamespace::new();
    let sync = namespace.add_memory_area("sync");
    let local = namespace.add_memory_area("local");
    let namespace = Arc::new(namespace);

    let group = StorageAdapter::named(Arc::clone(&namespace), "sync")
        .open("k")
        .unwrap();
    group.ready().await.unwrap();
    let store = group.store("k").unwrap();

    local.set(items(&[("k", json!("wrong area"))])).await.unwrap();
    sync.set(items(&[("k", json!("right area"))])).await.unwrap();
    wait_for(&store, Some(json!("right area"))).await;

    local.set(items(&[("k", json!("wrong again"))])).await.unwrap();
    settle().await;
    assert_that!(store.get(), is(equal_to(Some(json!("right area")))));
}

#[tokio::test]
async fn test_not_live_ignores_changes() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone())
        .live(false)
        .open("k")
        .unwrap();
    group.ready().await.unwrap();
    assert!(!group.is_live());

    area.set(items(&[("k", json!(1))])).await.unwrap();
    settle().await;
    assert_that!(group.store("k").unwrap().get(), is(equal_to(None)));
}

#[tokio::test]
async fn test_un_live_stops_updates() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();
    group.ready().await.unwrap();
    let store = group.store("k").unwrap();

    area.set(items(&[("k", json!(1))])).await.unwrap();
    wait_for(&store, Some(json!(1))).await;

    group.un_live();
    group.un_live();
    assert!(!group.is_live());

    area.set(items(&[("k", json!(2))])).await.unwrap();
    settle().await;
    assert_that!(store.get(), is(equal_to(Some(json!(1)))));

    // Local writes still go out
    store.set(json!(3));
    settle().await;
    assert_that!(area.items()["k"].clone(), is(equal_to(json!(3))));
}

#[tokio::test]
async fn test_un_live_on_never_live_group() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area).live(false).open("k").unwrap();
    group.un_live();
    assert!(!group.is_live());
}

#[tokio::test]
async fn test_lagging_feed_recovers_fixed_keys() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone()).open("k").unwrap();
    group.ready().await.unwrap();
    let store = group.store("k").unwrap();

    // No yield in between: the listener falls behind the feed
    area.set(items(&[("k", json!("final"))])).await.unwrap();
    for i in 0..CHANGE_FEED_CAPACITY + 44 {
        area.set(items(&[("other", json!(i))])).await.unwrap();
    }

    wait_for(&store, Some(json!("final"))).await;
    assert!(group.is_live());
}

#[tokio::test]
async fn test_lagging_feed_recovers_fixed_removal() {
    let area = seeded(&[("k", json!(1))]);
    let group = StorageAdapter::new(area.clone())
        .open([("k", json!("default"))])
        .unwrap();
    group.ready().await.unwrap();
    let store = group.store("k").unwrap();
    assert_that!(store.get(), is(equal_to(Some(json!(1)))));

    area.remove("k").await.unwrap();
    for i in 0..CHANGE_FEED_CAPACITY + 44 {
        area.set(items(&[("other", json!(i))])).await.unwrap();
    }

    wait_for(&store, Some(json!("default"))).await;
}

#[tokio::test]
async fn test_lagging_feed_recovers_dynamic_keys() {
    let area = seeded(&[("gone", json!(0))]);
    let group = StorageAdapter::new(area.clone())
        .open(KeySelection::All)
        .unwrap();
    group.ready().await.unwrap();
    assert_that!(group.stores().keys(), is(equal_to(vec!["gone".to_string()])));

    area.remove("gone").await.unwrap();
    let count = CHANGE_FEED_CAPACITY + 44;
    for i in 0..count {
        area.set(items(&[(format!("key{i:03}").as_str(), json!(i))]))
            .await
            .unwrap();
    }

    for _ in 0..100 {
        if group.stores().keys().len() == count {
            break;
        }
        settle().await;
    }
    let keys = group.stores().keys();
    assert_that!(keys.len(), is(equal_to(count)));
    assert!(!group.stores().contains("gone"));
    assert_that!(
        group.store("key299").unwrap().get(),
        is(equal_to(Some(json!(299))))
    );
    // Re-read values are not written back
    assert_that!(area.writes().len(), is(equal_to(count)));
}

// ----------------------------------------------------------------------------
// Setup errors
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_live_unsupported_without_feed() {
    common::init_logging();
    let namespace = StorageNamespace::new();
    let detached = Arc::new(MemStorage::attached("detached", namespace.sender()));

    let result = StorageAdapter::new(detached.clone()).open("k");
    assert_that!(result.err(), is(equal_to(Some(AdapterError::LiveUnsupported))));

    // Same area, not live: fine
    assert!(StorageAdapter::new(detached).live(false).open("k").is_ok());
}

#[tokio::test]
async fn test_unknown_area() {
    let namespace = Arc::new(StorageNamespace::in_memory());
    let result = StorageAdapter::named(namespace, "managed").open("k");
    assert_that!(
        result.err(),
        is(equal_to(Some(AdapterError::UnknownArea("managed".into()))))
    );
}

#[test]
fn test_no_runtime() {
    let result = StorageAdapter::new(Arc::new(MemStorage::new())).open("k");
    assert_that!(result.err(), is(equal_to(Some(AdapterError::NoRuntime))));
}

// ----------------------------------------------------------------------------
// All keys
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_dynamic_ready_enumerates_storage() {
    let area = seeded(&[("one", json!("A")), ("two", json!("B"))]);
    let group = StorageAdapter::new(area.clone())
        .open(KeySelection::All)
        .unwrap();
    assert!(group.stores().is_dynamic());

    group.ready().await.unwrap();
    assert_that!(group.stores().keys(), is(equal_to(vec!["one".to_string(), "two".to_string()])));
    assert_that!(group.store("two").unwrap().get(), is(equal_to(Some(json!("B")))));
    assert!(!group.stores().contains("three"));
}

#[tokio::test]
async fn test_dynamic_removed_key_leaves_enumeration() {
    let area = seeded(&[("one", json!("A")), ("two", json!("B"))]);
    let group = StorageAdapter::new(area.clone())
        .open(KeySelection::All)
        .unwrap();
    group.ready().await.unwrap();

    area.remove("one").await.unwrap();
    settle().await;
    assert_that!(group.stores().keys(), is(equal_to(vec!["two".to_string()])));
}

#[tokio::test]
async fn test_dynamic_new_remote_key_appears() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone())
        .open(KeySelection::All)
        .unwrap();
    group.ready().await.unwrap();
    assert!(group.stores().keys().is_empty());

    area.set(items(&[("fresh", json!(1))])).await.unwrap();
    settle().await;
    assert_that!(group.stores().keys(), is(equal_to(vec!["fresh".to_string()])));
    assert_that!(area.writes().len(), is(equal_to(1)));
}

#[tokio::test]
async fn test_dynamic_local_write_goes_upstream() {
    let area = seeded(&[]);
    let group = StorageAdapter::new(area.clone())
        .open(KeySelection::All)
        .unwrap();
    group.ready().await.unwrap();

    group.store("x").unwrap().set(json!("v"));
    assert!(group.stores().contains("x"));
    settle().await;
    assert_that!(area.items(), is(equal_to(items(&[("x", json!("v"))]))));
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_from_config() {
    common::init_logging();
    let namespace = StorageNamespace::in_memory();
    let local = namespace.area("local").unwrap();
    local
        .set(items(&[("theme", json!("dark"))]))
        .await
        .unwrap();
    let namespace = Arc::new(namespace);

    let config = AdapterConfig::from_json(
        r#"{"area": "local", "live": false, "keys": {"theme": "light", "size": 12}}"#,
    )
    .unwrap();
    let group = StorageAdapter::from_config(namespace, &config)
        .open(config.keys.clone())
        .unwrap();
    group.ready().await.unwrap();

    assert!(!group.is_live());
    assert_that!(
        group.stores().keys(),
        is(equal_to(vec!["theme".to_string(), "size".to_string()]))
    );
    assert_that!(group.store("theme").unwrap().get(), is(equal_to(Some(json!("dark")))));
    assert_that!(group.store("size").unwrap().get(), is(equal_to(Some(json!(12)))));
}
