//! Scenario: a bad record in a batch is rejected on its own; the rest are
//! processed in order.

use psm_reconcile::CancelFlag;
use psm_schemas::{Identity, RunOutcome};
use psm_testkit::fixture;
use serde_json::json;

fn five_with_third_missing_id() -> Vec<serde_json::Value> {
    vec![
        json!({"id": "A", "v": 1}),
        json!({"id": "B", "v": 2}),
        json!({"name": "no identity", "v": 3}),
        json!({"id": "D", "v": 4}),
        json!({"id": "E", "v": 5}),
    ]
}

#[tokio::test]
async fn import_and_reconcile_yields_four_outcomes_one_rejection() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);

    let stats = fx
        .engine
        .import_and_reconcile(&fx.ctx, src, tgt, &five_with_third_missing_id(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(stats.outcomes.len(), 4);
    assert_eq!(stats.created, 4);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.rejections.len(), 1);
    assert_eq!(stats.rejections[0].position, 2);
    assert!(stats.rejections[0].reason.contains("missing identity"));
    assert_eq!(stats.outcome, RunOutcome::Partial);

    let order: Vec<Identity> = stats.outcomes.iter().map(|o| o.identity.clone()).collect();
    assert_eq!(
        order,
        vec![
            Identity::from("A"),
            Identity::from("B"),
            Identity::from("D"),
            Identity::from("E")
        ]
    );

    let runs = fx.store().runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].rejected, 1);
    assert_eq!(runs[0].outcome, RunOutcome::Partial);
}

#[tokio::test]
async fn import_reports_position_of_rejection() {
    let fx = fixture().await;
    let stats = fx
        .engine
        .import(&fx.ctx, fx.source.collection_id, &five_with_third_missing_id())
        .await
        .unwrap();
    assert_eq!(stats.created, 4);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.rejections[0].position, 2);
    assert_eq!(stats.rejections[0].identity, None);
}

#[tokio::test]
async fn storage_failure_during_import_stage_is_reported_on_the_run() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);
    fx.store().fail_insert("A");

    let raws = vec![json!({"id": "A", "v": 1}), json!({"id": "B", "v": 2})];
    let stats = fx
        .engine
        .import_and_reconcile(&fx.ctx, src, tgt, &raws, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(stats.created, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.outcome, RunOutcome::Partial);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].identity, Identity::from("A"));
    assert!(stats.failures[0].error.contains("injected insert failure"));
    assert_eq!(stats.rejections.len(), 1);
    assert_eq!(stats.rejections[0].position, 0);

    let run = fx.store().runs().pop().unwrap();
    assert_eq!(run.rejected, 1);
    assert_eq!(run.outcome, RunOutcome::Partial);
}
