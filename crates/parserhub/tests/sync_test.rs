// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pull/push protocol tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use common::*;
use parserhub::continuous::ContinuousSupervisor;
use parserhub::invalidation::{InvalidationBus, LocalBus};
use parserhub::record::SOURCE_PLACEHOLDER;
use parserhub::store::ParserStore;
use parserhub::sync::{PushRequest, SyncService};

async fn service() -> (SyncService, Arc<CountingStore>, Arc<LocalBus>) {
    let store = Arc::new(CountingStore::new(Arc::new(sqlite_store().await)));
    let bus = Arc::new(LocalBus::default());
    (SyncService::new(store.clone(), bus.clone()), store, bus)
}

fn push(upsert: Vec<parserhub::record::PartialParserRecord>, delete: &[&str]) -> PushRequest {
    PushRequest {
        upsert,
        delete: delete.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_hash_ignores_provide_order() {
    let (sync, _, _) = service().await;
    let code = static_code(json!([1]));

    let first = upload_with("importers/x", &["helpers/b", "helpers/a"], code.clone());
    let first = sync.push(push(vec![first], &[])).await.unwrap();
    let second = upload_with("importers/x", &["helpers/a", "helpers/b"], code);
    let second = sync.push(push(vec![second], &[])).await.unwrap();

    assert_eq!(first.upserted[0].hash, second.upserted[0].hash);
    assert_eq!(second.upserted[0].provide, vec!["helpers/a", "helpers/b"]);
}

#[tokio::test]
async fn test_hash_changes_with_code() {
    let (sync, _, _) = service().await;

    let compact = sync
        .push(push(vec![upload("importers/x", static_code(json!([1])))], &[]))
        .await
        .unwrap();

    let mut spaced = upload("importers/x", json!({}));
    spaced.code = format!("{} ", static_code(json!([1])));
    let spaced = sync.push(push(vec![spaced], &[])).await.unwrap();

    assert_ne!(compact.upserted[0].hash, spaced.upserted[0].hash);
}

#[tokio::test]
async fn test_push_response_omits_source() {
    let (sync, _, _) = service().await;

    let response = sync
        .push(push(vec![upload("importers/x", static_code(json!([1])))], &[]))
        .await
        .unwrap();

    assert_eq!(response.upserted[0].source, SOURCE_PLACEHOLDER);
    assert!(!response.restarted);
}

#[tokio::test]
async fn test_pull_completeness() {
    let (sync, _, _) = service().await;
    sync.push(push(
        vec![
            upload("importers/a", static_code(json!([1]))),
            upload("importers/b", static_code(json!([2]))),
            upload("helpers/c", static_code(json!([3]))),
        ],
        &[],
    ))
    .await
    .unwrap();

    let everything = sync.pull(&[]).await.unwrap();
    assert_eq!(everything.len(), 3);
    assert!(everything.iter().all(|doc| !doc.source.is_empty()));
    assert!(
        everything
            .iter()
            .all(|doc| doc.source != SOURCE_PLACEHOLDER)
    );

    let known: Vec<String> = everything.iter().map(|doc| doc.hash.clone()).collect();
    assert!(sync.pull(&known).await.unwrap().is_empty());

    let partial = sync.pull(&known[..1]).await.unwrap();
    assert_eq!(partial.len(), 2);
    assert!(partial.iter().all(|doc| doc.hash != known[0]));
}

#[tokio::test]
async fn test_pull_returns_authored_source() {
    let (sync, _, _) = service().await;
    let mut upload = upload("importers/a", static_code(json!([1])));
    upload.source = Some("// authored by hand\nitems = [1]".to_string());

    sync.push(push(vec![upload], &[])).await.unwrap();

    let docs = sync.pull(&[]).await.unwrap();
    assert_eq!(docs[0].source, "// authored by hand\nitems = [1]");
}

#[tokio::test]
async fn test_push_announces_upserts_and_deletes() {
    let (sync, _, bus) = service().await;
    sync.push(push(vec![upload("importers/old", static_code(json!([1])))], &[]))
        .await
        .unwrap();

    let mut messages = bus.subscribe().await.unwrap();
    let response = sync
        .push(push(
            vec![upload("importers/new", static_code(json!([2])))],
            &["importers/old", "importers/never-existed"],
        ))
        .await
        .unwrap();

    assert_eq!(response.deleted, vec!["importers/old".to_string()]);

    let deleted = messages.next().await.unwrap();
    assert_eq!(deleted.identities(), ["importers/old".to_string()]);
    let upserted = messages.next().await.unwrap();
    assert_eq!(upserted.identities(), ["importers/new".to_string()]);
}

#[tokio::test]
async fn test_failed_write_announces_nothing() {
    let (sync, store, bus) = service().await;
    let mut messages = bus.subscribe().await.unwrap();

    store.fail_writes(true);
    let err = sync
        .push(push(vec![upload("importers/x", static_code(json!([1])))], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, parserhub::Error::StoreWrite(_)), "{:?}", err);

    let next = tokio::time::timeout(Duration::from_millis(100), messages.next()).await;
    assert!(next.is_err(), "nothing should have been published");
    assert!(store.get("importers/x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_push_is_rejected_before_writing() {
    let (sync, store, _) = service().await;

    let err = sync
        .push(push(
            vec![
                upload("importers/fine", static_code(json!([1]))),
                upload("no-kind-prefix", static_code(json!([1]))),
            ],
            &[],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, parserhub::Error::InvalidRequest(_)));
    assert!(store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_continuous_change_restarts_runner() {
    let (sync, _, _) = service().await;
    let supervisor = Arc::new(RecordingSupervisor::default());
    let sync = sync.with_supervisor(supervisor.clone());

    let response = sync
        .push(push(vec![upload("importers/plain", static_code(json!([1])))], &[]))
        .await
        .unwrap();
    assert!(!response.restarted);
    assert_eq!(supervisor.restarts(), 0);

    let mut continuous = upload("importers/plain", static_code(json!([1])));
    continuous.continuous = true;
    let response = sync.push(push(vec![continuous], &[])).await.unwrap();
    assert!(response.restarted);
    assert_eq!(supervisor.restarts(), 1);

    // Turning it off again also needs a restart to stop it
    let response = sync
        .push(push(vec![upload("importers/plain", static_code(json!([1])))], &[]))
        .await
        .unwrap();
    assert!(response.restarted);
    assert_eq!(supervisor.restarts(), 2);
    assert_eq!(supervisor.starts(), 0);
}
