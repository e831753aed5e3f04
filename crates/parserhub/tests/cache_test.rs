// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cache loading and cross-process invalidation tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use parserhub::Engine;
use parserhub::cache::ParserCache;
use parserhub::invalidation::LocalBus;
use parserhub::plugin::PluginRegistry;
use parserhub::store::ParserStore;
use parserhub::sync::PushRequest;

async fn seeded_store() -> Arc<CountingStore> {
    let store = sqlite_store().await;
    store
        .upsert(
            &[
                record("importers/root", &["helpers/a", "helpers/b"], static_code(json!([1]))),
                record("helpers/a", &["helpers/c"], static_code(json!([2]))),
                record("helpers/b", &["helpers/c"], static_code(json!([3]))),
                record("helpers/c", &[], static_code(json!([4]))),
                record("helpers/unrelated", &[], static_code(json!([5]))),
            ],
            10,
        )
        .await
        .unwrap();
    Arc::new(CountingStore::new(Arc::new(store)))
}

fn cache_over(store: Arc<CountingStore>) -> ParserCache {
    ParserCache::new(store, Arc::new(PluginRegistry::with_builtins()))
}

#[tokio::test]
async fn test_closure_loads_exactly_the_reachable_set() {
    let store = seeded_store().await;
    let cache = cache_over(store.clone());

    cache.ensure_loaded("importers/root").await.unwrap();

    for id in ["importers/root", "helpers/a", "helpers/b", "helpers/c"] {
        assert!(cache.contains(id), "{} should be resident", id);
    }
    assert!(!cache.contains("helpers/unrelated"));
    assert_eq!(cache.len(), 4);
    assert_eq!(store.closure_fetches(), 1);
}

#[tokio::test]
async fn test_resident_identities_are_not_fetched_again() {
    let store = seeded_store().await;
    let cache = cache_over(store.clone());

    cache.ensure_loaded("helpers/c").await.unwrap();
    assert_eq!(store.closure_fetches(), 1);

    // Second call for a fully resident tree never touches the store
    cache.ensure_loaded("helpers/c").await.unwrap();
    assert_eq!(store.closure_fetches(), 1);

    // Loading the root only pulls what is not already resident
    cache.ensure_loaded("importers/root").await.unwrap();
    assert_eq!(store.closure_fetches(), 2);
    assert_eq!(cache.len(), 4);
}

#[tokio::test]
async fn test_invalidate_then_load_refetches_once() {
    let store = seeded_store().await;
    let cache = cache_over(store.clone());

    cache.ensure_loaded("helpers/a").await.unwrap();
    let before = store.closure_fetches();

    assert_eq!(cache.invalidate(&["helpers/a".to_string()]), 1);
    assert!(!cache.contains("helpers/a"));
    assert!(cache.contains("helpers/c"));

    cache.ensure_loaded("helpers/a").await.unwrap();
    assert_eq!(store.closure_fetches(), before + 1);
    assert!(cache.contains("helpers/a"));
}

#[tokio::test]
async fn test_unknown_dependency_is_not_refetched_every_load() {
    let store = sqlite_store().await;
    store
        .upsert(
            &[record("importers/root", &["helpers/ghost"], static_code(json!([1])))],
            10,
        )
        .await
        .unwrap();
    let store = Arc::new(CountingStore::new(Arc::new(store)));
    let cache = cache_over(store.clone());

    cache.ensure_loaded("importers/root").await.unwrap();
    assert_eq!(store.closure_fetches(), 1);

    for _ in 0..3 {
        cache
            .ensure_loaded_many(&["importers/root".to_string()])
            .await
            .unwrap();
    }
    assert_eq!(store.closure_fetches(), 1);

    // Announcing the identity forgets the miss
    cache.invalidate(&["helpers/ghost".to_string()]);
    cache.ensure_loaded("importers/root").await.unwrap();
    assert_eq!(store.closure_fetches(), 2);
}

#[tokio::test]
async fn test_push_on_one_engine_invalidates_another() {
    let store: Arc<dyn ParserStore> = Arc::new(sqlite_store().await);
    let bus = Arc::new(LocalBus::default());

    let writer = Engine::builder()
        .store(store.clone())
        .bus(bus.clone())
        .listen(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let reader = Engine::builder()
        .store(store.clone())
        .bus(bus.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    // Seed without an announcement so the first load cannot race with one
    store
        .upsert(&[record("importers/news", &[], static_code(json!(["old"])))], 10)
        .await
        .unwrap();

    let items = reader
        .invoke("importers/news", Default::default(), 10)
        .await
        .unwrap();
    assert_eq!(items, vec![json!("old")]);
    assert!(reader.cache().contains("importers/news"));

    writer
        .push(PushRequest {
            upsert: vec![upload("importers/news", static_code(json!(["new"])))],
            delete: vec![],
        })
        .await
        .unwrap();

    // The listener applies evictions asynchronously
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.cache().contains("importers/news") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reader cache was never invalidated");

    let items = reader
        .invoke("importers/news", Default::default(), 10)
        .await
        .unwrap();
    assert_eq!(items, vec![json!("new")]);

    writer.shutdown().await;
    reader.shutdown().await;
}

#[tokio::test]
async fn test_deleted_parser_is_evicted_and_no_longer_loadable() {
    let store: Arc<dyn ParserStore> = Arc::new(sqlite_store().await);
    let bus = Arc::new(LocalBus::default());

    let engine = Engine::builder()
        .store(store)
        .bus(bus)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    engine
        .push(PushRequest {
            upsert: vec![upload("importers/gone", static_code(json!([1])))],
            delete: vec![],
        })
        .await
        .unwrap();
    engine
        .invoke("importers/gone", Default::default(), 1)
        .await
        .unwrap();

    let response = engine
        .push(PushRequest {
            upsert: vec![],
            delete: vec!["importers/gone".to_string()],
        })
        .await
        .unwrap();
    assert_eq!(response.deleted, vec!["importers/gone".to_string()]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.cache().contains("importers/gone") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deleted parser stayed resident");

    let err = engine
        .invoke("importers/gone", Default::default(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, parserhub::Error::ParserNotFound(_)), "{:?}", err);

    engine.shutdown().await;
}
