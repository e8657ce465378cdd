//! Scenario: cleanup deletes exactly the snapshots older than the horizon.
//!
//! Snapshots aged 5, 29, 31 and 60 days with a 30-day horizon: the 31- and
//! 60-day ones go, the others stay. Records are never touched.

use chrono::Duration;
use psm_reconcile::{CancelFlag, RecordStore};
use psm_schemas::{CollectionScope, Identity, Payload};
use psm_testkit::{epoch, fixture, fixture_on};
use serde_json::json;

#[tokio::test]
async fn deletes_only_snapshots_past_the_horizon() {
    let fx = fixture().await;
    let scope = CollectionScope::new(fx.ctx.tenant_id, fx.target.collection_id);
    let now = epoch() + Duration::days(100);

    for age in [5, 29, 31, 60] {
        fx.store()
            .plant_snapshot(
                scope,
                format!("R{age}").as_str(),
                Payload::from(json!({"age": age})),
                now - Duration::days(age),
            )
            .unwrap();
    }

    let deleted = fx.engine.cleanup(&fx.ctx, now).await.unwrap();
    assert_eq!(deleted, 2);

    let remaining: Vec<String> = fx
        .store()
        .all_snapshots()
        .into_iter()
        .map(|s| s.identity.to_string())
        .collect();
    assert_eq!(remaining, vec!["R5".to_string(), "R29".to_string()]);
}

#[tokio::test]
async fn cleanup_covers_source_and_target_but_not_records() {
    let fx = fixture().await;
    let (src, tgt) = (fx.source.collection_id, fx.target.collection_id);
    let cancel = CancelFlag::new();

    fx.engine
        .import(&fx.ctx, src, &[json!({"id": "P1", "v": 1})])
        .await
        .unwrap();
    fx.engine.reconcile(&fx.ctx, src, tgt, &cancel).await.unwrap();
    fx.engine
        .import(&fx.ctx, src, &[json!({"id": "P1", "v": 2})])
        .await
        .unwrap();
    fx.engine.reconcile(&fx.ctx, src, tgt, &cancel).await.unwrap();
    assert_eq!(fx.store().snapshot_count(), 2);

    let later = fx.clock.peek() + Duration::days(31);
    let deleted = fx.engine.cleanup(&fx.ctx, later).await.unwrap();
    assert_eq!(deleted, 2);

    let p1 = Identity::from("P1");
    let src_rec = fx
        .store()
        .get_record(CollectionScope::new(fx.ctx.tenant_id, src), &p1)
        .await
        .unwrap();
    let tgt_rec = fx
        .store()
        .get_record(CollectionScope::new(fx.ctx.tenant_id, tgt), &p1)
        .await
        .unwrap();
    assert!(src_rec.is_some());
    assert_eq!(tgt_rec.unwrap().payload.get("v"), Some(&Payload::from(2)));
}

#[tokio::test]
async fn cleanup_is_tenant_scoped() {
    let a = fixture().await;
    let b = fixture_on(a.store().clone()).await;
    let now = epoch() + Duration::days(100);

    let scope_a = CollectionScope::new(a.ctx.tenant_id, a.target.collection_id);
    let scope_b = CollectionScope::new(b.ctx.tenant_id, b.target.collection_id);
    a.store()
        .plant_snapshot(scope_a, "X", Payload::from(1), now - Duration::days(90))
        .unwrap();
    b.store()
        .plant_snapshot(scope_b, "X", Payload::from(1), now - Duration::days(90))
        .unwrap();

    assert_eq!(a.engine.cleanup(&a.ctx, now).await.unwrap(), 1);
    assert_eq!(a.store().snapshot_count(), 1);
}

#[tokio::test]
async fn horizon_past_the_start_of_time_deletes_nothing() {
    let fx = fixture().await;
    let scope = CollectionScope::new(fx.ctx.tenant_id, fx.target.collection_id);
    fx.store()
        .plant_snapshot(scope, "OLD", Payload::from(1), epoch() - Duration::days(3650))
        .unwrap();

    let ctx = fx.ctx.clone().with_retention_days(u32::MAX);
    let deleted = fx.engine.cleanup(&ctx, epoch()).await.unwrap();

    assert_eq!(deleted, 0);
    assert_eq!(fx.store().snapshot_count(), 1);
}
