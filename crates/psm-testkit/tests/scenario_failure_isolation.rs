//! Scenario: a storage failure on one record fails that record only; a
//! collection that cannot be opened fails the whole run before any record.

use psm_reconcile::{CancelFlag, RecordStore, RunError};
use psm_schemas::{CollectionId, CollectionScope, Identity, Payload, RecordAction, RunOutcome};
use psm_testkit::fixture;
use serde_json::json;

#[tokio::test]
async fn read_failure_is_attached_to_its_identity() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);

    let raws: Vec<_> = ["A", "B", "C"].iter().map(|id| json!({"id": id})).collect();
    fx.engine.import(&fx.ctx, src, &raws).await.unwrap();
    fx.store().fail_get("B");

    let stats = fx
        .engine
        .reconcile(&fx.ctx, src, tgt, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(stats.created, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.outcome, RunOutcome::Partial);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].identity, Identity::from("B"));
    assert!(stats.failures[0].error.contains("injected read failure"));

    let actions: Vec<RecordAction> = stats.outcomes.iter().map(|o| o.action).collect();
    assert_eq!(
        actions,
        vec![RecordAction::Created, RecordAction::Failed, RecordAction::Created]
    );
}

#[tokio::test]
async fn insert_failure_does_not_stop_later_records() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);

    let raws: Vec<_> = ["A", "B"].iter().map(|id| json!({"id": id})).collect();
    fx.engine.import(&fx.ctx, src, &raws).await.unwrap();
    fx.store().fail_insert("A");

    let stats = fx
        .engine
        .reconcile(&fx.ctx, src, tgt, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.failures[0].identity, Identity::from("A"));
}

#[tokio::test]
async fn unknown_target_fails_run_with_zero_processed() {
    let fx = fixture().await;
    fx.engine
        .import(&fx.ctx, fx.source.collection_id, &[json!({"id": "A"})])
        .await
        .unwrap();

    let err = fx
        .engine
        .reconcile(
            &fx.ctx,
            fx.source.collection_id,
            CollectionId::new_random(),
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();

    match err {
        RunError::CollectionUnavailable { stats, reason } => {
            assert_eq!(stats.outcome, RunOutcome::Failed);
            assert_eq!(stats.processed(), 0);
            assert!(reason.to_string().contains("collection not found"));
        }
        other => panic!("expected CollectionUnavailable, got {other:?}"),
    }

    let run = fx.store().runs().pop().unwrap();
    assert_eq!(run.outcome, RunOutcome::Failed);
    assert!(run
        .message
        .as_deref()
        .unwrap_or_default()
        .starts_with("cannot open collection"));
}

#[tokio::test]
async fn swapped_collections_are_wrong_kind() {
    let fx = fixture().await;
    let err = fx
        .engine
        .reconcile(
            &fx.ctx,
            fx.target.collection_id,
            fx.source.collection_id,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot open collection"));
}

#[tokio::test]
async fn unencodable_source_payload_fails_only_that_record() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);
    let source = CollectionScope::new(fx.ctx.tenant_id, src);

    fx.engine
        .import(&fx.ctx, src, &[json!({"id": "A"}), json!({"id": "B"})])
        .await
        .unwrap();

    let mut rows = fx.store().list_records(source).await.unwrap();
    let mut broken = rows.remove(0);
    broken.payload = Payload::from(f64::NAN);
    fx.store().overwrite_raw(source, broken);

    let stats = fx
        .engine
        .reconcile(&fx.ctx, src, tgt, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.failures[0].identity, Identity::from("A"));
    assert!(stats.failures[0].error.contains("cannot encode payload"));
}
