//! Scenario: running twice with no source change mutates nothing.
//!
//! GREEN when the second run reports only skipped_unchanged, writes no
//! snapshots and leaves every target record byte-identical.

use psm_reconcile::CancelFlag;
use psm_schemas::{RecordAction, RunOutcome};
use psm_testkit::fixture;
use serde_json::json;

#[tokio::test]
async fn second_run_is_a_no_op() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);
    let cancel = CancelFlag::new();

    let raws = vec![
        json!({"id": "A", "beds": 2}),
        json!({"id": "B", "beds": 3, "tags": ["sea", "pool"]}),
        json!({"external_id": 17, "beds": 1}),
    ];
    fx.engine.import(&fx.ctx, src, &raws).await.unwrap();

    let first = fx.engine.reconcile(&fx.ctx, src, tgt, &cancel).await.unwrap();
    assert_eq!(first.created, 3);

    let before = fx.engine.list_target(&fx.ctx, tgt).await.unwrap();
    let snaps_before = fx.store().snapshot_count();

    let second = fx.engine.reconcile(&fx.ctx, src, tgt, &cancel).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Success);
    assert_eq!(second.skipped_unchanged, 3);
    assert_eq!(second.created + second.updated + second.skipped_conflict, 0);
    assert!(second
        .outcomes
        .iter()
        .all(|o| o.action == RecordAction::SkippedUnchanged));

    let after = fx.engine.list_target(&fx.ctx, tgt).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.store().snapshot_count(), snaps_before);
}

#[tokio::test]
async fn reimporting_identical_batch_changes_nothing() {
    let fx = fixture().await;
    let src = fx.source.collection_id;
    let raws = vec![json!({"id": "A", "v": 1}), json!({"id": "B", "v": 2})];

    let first = fx.engine.import(&fx.ctx, src, &raws).await.unwrap();
    assert_eq!(first.created, 2);

    let again = fx.engine.import(&fx.ctx, src, &raws).await.unwrap();
    assert_eq!(again.unchanged, 2);
    assert_eq!(again.created + again.updated, 0);
    assert_eq!(fx.store().snapshot_count(), 0);
}
