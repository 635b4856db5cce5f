use chrono::{Duration, Utc};

use crate::error::DispatchError;
use crate::queue::{self, DeliveryQueue, QueueState};
use crate::store::{DocumentRecord, DocumentStore};
use crate::tests::{queued_job, store};

#[tokio::test]
async fn test_state_ops_persist_immediately() {
    let store = store();
    store.insert_queue(DeliveryQueue::new("orders", "guaranteed"));

    let disabled = queue::disable(store.as_ref(), "orders").await.unwrap();
    assert_eq!(disabled.state, QueueState::Disabled);
    assert_eq!(store.queue("orders").unwrap().state, QueueState::Disabled);

    let enabled = queue::enable(store.as_ref(), "orders").await.unwrap();
    assert_eq!(enabled.state, QueueState::Enabled);
    assert_eq!(store.queue("orders").unwrap().state, QueueState::Enabled);

    let draining = queue::drain(store.as_ref(), "orders").await.unwrap();
    assert_eq!(draining.state, QueueState::Draining);
    assert!(store.queue("orders").unwrap().state.is_draining());

    let suspended = queue::suspend(store.as_ref(), "orders").await.unwrap();
    assert_eq!(suspended.state, QueueState::Suspended);
    assert!(store.queue("orders").unwrap().state.is_suspended());
}

#[tokio::test]
async fn test_unknown_queue_control_errors() {
    let store = store();
    let err = queue::enable(store.as_ref(), "ghost").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownQueue(name) if name == "ghost"));
}

#[tokio::test]
async fn test_refresh_picks_up_external_change() {
    let store = store();
    store.insert_queue(DeliveryQueue::new("orders", "guaranteed"));
    let stale = store.queue("orders").unwrap();

    // another server flips the state behind our back
    store.insert_queue(DeliveryQueue::new("orders", "guaranteed").with_state(QueueState::Draining));

    let fresh = queue::refresh(store.as_ref(), stale).await.unwrap();
    assert_eq!(fresh.state, QueueState::Draining);
}

#[tokio::test]
async fn test_refresh_falls_back_to_copy_in_hand() {
    let store = store();
    let local = DeliveryQueue::new("orders", "guaranteed").with_state(QueueState::Draining);

    let fresh = queue::refresh(store.as_ref(), local).await.unwrap();
    assert_eq!(fresh.name, "orders");
    assert_eq!(fresh.state, QueueState::Draining);
}

#[tokio::test]
async fn test_length_counts_eligible() {
    let store = store();
    store.insert_job(queued_job("orders", "doc-1", 0, 1.0, 0));
    store.insert_job(queued_job("orders", "doc-2", 0, 1.0, 0));
    store.insert_job(
        queued_job("orders", "doc-3", 0, 1.0, 0).with_updated_at(Utc::now() + Duration::seconds(60)),
    );

    assert_eq!(
        queue::length(store.as_ref(), "orders", None).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_jobs_for_document_lists_ids() {
    let store = store();
    let a = queued_job("orders", "doc-1", 0, 1.0, 0);
    let b = queued_job("invoices", "doc-1", 0, 1.0, 0);
    let other = queued_job("orders", "doc-2", 0, 1.0, 0);
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    store.insert_job(a);
    store.insert_job(b);
    store.insert_job(other);

    let ids = queue::jobs_for_document(store.as_ref(), "doc-1")
        .await
        .unwrap();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_unrecoverable_errors_flag() {
    let store = store();
    store.put_document(
        "doc-1",
        DocumentRecord {
            unrecoverable: true,
            ..Default::default()
        },
    );

    assert!(store.has_unrecoverable_errors("doc-1").await.unwrap());
    assert!(!store.has_unrecoverable_errors("doc-2").await.unwrap());
}
