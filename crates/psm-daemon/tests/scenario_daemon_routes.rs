//! In-process scenario tests for psm-daemon HTTP endpoints.
//!
//! The router runs on an in-memory store without binding a TCP socket and is
//! driven via `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use psm_daemon::{
    routes,
    state::{AppState, BusMsg, SyncDefaults},
};
use psm_reconcile::{RecordStore, SyncEngine};
use psm_schemas::{CollectionId, CollectionScope, TenantId};
use psm_testkit::MemoryStore;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type State = Arc<AppState<MemoryStore>>;

fn make_state() -> State {
    Arc::new(AppState::new(
        SyncEngine::new(MemoryStore::new()),
        SyncDefaults::default(),
    ))
}

async fn call(st: &State, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let resp = routes::build_router(Arc::clone(st))
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Create a source and a target for `tenant`; returns their ids.
async fn setup_pair(st: &State, tenant: TenantId) -> (CollectionId, CollectionId) {
    let uri = format!("/v1/tenants/{tenant}/collections");
    let (s1, src) = call(st, "POST", &uri, Some(json!({"name": "feed", "kind": "source"}))).await;
    let (s2, tgt) = call(st, "POST", &uri, Some(json!({"name": "site", "kind": "target"}))).await;
    assert_eq!(s1, StatusCode::CREATED);
    assert_eq!(s2, StatusCode::CREATED);
    let id = |v: &Value| -> CollectionId {
        serde_json::from_value(v["collection_id"].clone()).expect("collection_id")
    };
    (id(&src), id(&tgt))
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state();
    let (status, json) = call(&st, "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "psm-daemon");
}

#[tokio::test]
async fn status_lists_no_active_runs_when_idle() {
    let st = make_state();
    let (status, json) = call(&st, "GET", "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["active_runs"], json!([]));
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn collections_are_created_listed_and_unique_per_kind() {
    let st = make_state();
    let tenant = TenantId::new_random();
    setup_pair(&st, tenant).await;

    let uri = format!("/v1/tenants/{tenant}/collections");
    let (status, json) = call(&st, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().map(Vec::len), Some(2));

    let (status, json) = call(&st, "POST", &uri, Some(json!({"name": "feed", "kind": "source"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "already_exists");

    // Another tenant sees nothing.
    let other = format!("/v1/tenants/{}/collections", TenantId::new_random());
    let (_, json) = call(&st, "GET", &other, None).await;
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn blank_collection_name_is_400() {
    let st = make_state();
    let uri = format!("/v1/tenants/{}/collections", TenantId::new_random());
    let (status, json) = call(&st, "POST", &uri, Some(json!({"name": "  ", "kind": "target"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");
}

#[tokio::test]
async fn malformed_tenant_uuid_is_400() {
    let st = make_state();
    let (status, _) = call(&st, "GET", "/v1/tenants/not-a-uuid/collections", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Import + sync round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_sync_edit_conflict_and_accept_source() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    let mut rx = st.bus.subscribe();

    let import_uri = format!("/v1/tenants/{tenant}/sources/{src}/import");
    let (status, json) = call(
        &st,
        "POST",
        &import_uri,
        Some(json!({"data": [{"id": "A", "price": 100}, {"id": "B", "price": 200}, {"price": 1}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["created"], 2);
    assert_eq!(json["rejected"], 1);

    let sync_uri = format!("/v1/tenants/{tenant}/sync/{src}/{tgt}");
    let (status, json) = call(&st, "POST", &sync_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["created"], 2);
    assert_eq!(json["outcome"], "success");

    // Out-of-band edit on the target.
    let edit_uri = format!("/v1/tenants/{tenant}/targets/{tgt}/properties/A");
    let (status, json) = call(&st, "PATCH", &edit_uri, Some(json!({"price": 999}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["payload"]["price"], 999);

    // Source moves on; the edited record is flagged, not overwritten.
    call(&st, "POST", &import_uri, Some(json!([{"id": "A", "price": 150}]))).await;
    let (status, json) = call(&st, "POST", &sync_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["skipped_conflict"], 1);

    let props_uri = format!("/v1/tenants/{tenant}/targets/{tgt}/properties");
    let (_, json) = call(&st, "GET", &props_uri, None).await;
    let a = json
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["identity"] == "A")
        .cloned()
        .unwrap();
    assert_eq!(a["payload"]["price"], 999);
    assert_eq!(a["manual_change_flag"], true);
    assert!(a["warning_message"].is_string());

    let accept_uri = format!("/v1/tenants/{tenant}/targets/{tgt}/properties/A/accept-source/{src}");
    let (status, json) = call(&st, "POST", &accept_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["payload"]["price"], 150);
    assert_eq!(json["manual_change_flag"], false);

    let mut saw_conflict = false;
    let mut finished = 0;
    while let Ok(msg) = rx.try_recv() {
        match msg {
            BusMsg::Conflict { identity, .. } => {
                assert_eq!(identity.as_str(), "A");
                saw_conflict = true;
            }
            BusMsg::RunFinished { .. } => finished += 1,
            _ => {}
        }
    }
    assert!(saw_conflict);
    assert_eq!(finished, 2);
}

#[tokio::test]
async fn invalid_edits_map_to_client_errors() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/sources/{src}/import"),
        Some(json!([{"id": "A", "price": 1}])),
    )
    .await;
    call(&st, "POST", &format!("/v1/tenants/{tenant}/sync/{src}/{tgt}"), None).await;

    let base = format!("/v1/tenants/{tenant}/targets/{tgt}/properties");
    let (status, json) = call(&st, "PATCH", &format!("{base}/A"), Some(json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_patch");

    let (status, json) = call(&st, "PATCH", &format!("{base}/A"), Some(json!({"id": "Z"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_patch");

    let (status, json) = call(&st, "PATCH", &format!("{base}/missing"), Some(json!({"x": 1}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["kind"], "record_not_found");

    // Editing a source collection is a kind mismatch.
    let (status, json) = call(
        &st,
        "PATCH",
        &format!("/v1/tenants/{tenant}/targets/{src}/properties/A"),
        Some(json!({"x": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "wrong_kind");
}

#[tokio::test]
async fn source_properties_are_listed_as_imported() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/sources/{src}/import"),
        Some(json!([{"id": "B", "price": 2}, {"id": "A", "price": 1}])),
    )
    .await;

    let (status, json) = call(&st, "GET", &format!("/v1/tenants/{tenant}/sources/{src}/properties"), None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["identity"].as_str())
        .collect();
    assert_eq!(ids, vec!["B", "A"]);

    let (status, json) = call(&st, "GET", &format!("/v1/tenants/{tenant}/sources/{tgt}/properties"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "wrong_kind");
}

#[tokio::test]
async fn deleted_collection_is_inactive_and_refuses_runs() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/sources/{src}/import"),
        Some(json!([{"id": "A", "price": 1}])),
    )
    .await;

    let (status, json) = call(&st, "DELETE", &format!("/v1/tenants/{tenant}/collections/{tgt}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_active"], false);

    let (_, json) = call(&st, "GET", &format!("/v1/tenants/{tenant}/collections"), None).await;
    let listed = json
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["kind"] == "target")
        .cloned()
        .unwrap();
    assert_eq!(listed["is_active"], false);

    let (status, json) = call(&st, "POST", &format!("/v1/tenants/{tenant}/sync/{src}/{tgt}"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "collection_unavailable");

    let (status, json) = call(&st, "GET", &format!("/v1/tenants/{tenant}/targets/{tgt}/properties"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "collection_inactive");

    let missing = CollectionId::new_random();
    let (status, _) = call(&st, "DELETE", &format!("/v1/tenants/{tenant}/collections/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_is_409_while_a_run_holds_the_collection() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (_, tgt) = setup_pair(&st, tenant).await;
    let scope = CollectionScope::new(tenant, tgt);
    let uri = format!("/v1/tenants/{tenant}/collections/{tgt}");

    let active = st.begin_active(scope).expect("scope free");
    let (status, json) = call(&st, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "run_in_progress");
    drop(active);

    let held = st.engine.store().try_lock_target(scope).await.unwrap().unwrap();
    let (status, _) = call(&st, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    drop(held);

    let (status, _) = call(&st, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(st.active_scopes().is_empty());
}

// ---------------------------------------------------------------------------
// Run refusal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_is_409_while_store_lock_is_held() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    let scope = CollectionScope::new(tenant, tgt);

    let held = st.engine.store().try_lock_target(scope).await.unwrap().unwrap();

    let uri = format!("/v1/tenants/{tenant}/sync/{src}/{tgt}");
    let (status, json) = call(&st, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "run_in_progress");
    assert!(st.engine.store().runs().is_empty());
    // The refused request does not linger in the active map.
    assert!(st.active_scopes().is_empty());

    drop(held);
    let (status, _) = call(&st, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sync_is_409_while_daemon_run_is_active_and_cancel_trips_it() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, tgt) = setup_pair(&st, tenant).await;
    let scope = CollectionScope::new(tenant, tgt);

    let active = st.begin_active(scope).expect("scope free");

    let (status, json) = call(&st, "GET", "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["active_runs"].as_array().map(Vec::len), Some(1));

    let (status, _) = call(&st, "POST", &format!("/v1/tenants/{tenant}/sync/{src}/{tgt}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let cancel_uri = format!("/v1/tenants/{tenant}/targets/{tgt}/cancel");
    let (status, json) = call(&st, "POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], true);
    assert!(active.cancel.is_cancelled());

    drop(active);
    let (_, json) = call(&st, "POST", &cancel_uri, None).await;
    assert_eq!(json["cancelled"], false);
}

#[tokio::test]
async fn sync_into_unknown_target_is_422_with_failed_stats() {
    let st = make_state();
    let tenant = TenantId::new_random();
    let (src, _) = setup_pair(&st, tenant).await;
    let missing = CollectionId::new_random();

    let uri = format!("/v1/tenants/{tenant}/sync/{src}/{missing}");
    let (status, json) = call(&st, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "collection_unavailable");
    assert_eq!(json["stats"]["outcome"], "failed");

    let runs = st.engine.store().runs();
    assert_eq!(runs.len(), 1);
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleanup_reports_retention_used() {
    let st = make_state();
    let tenant = TenantId::new_random();

    let (status, json) = call(&st, "POST", &format!("/v1/tenants/{tenant}/cleanup"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retention_days"], st.defaults.retention_days);
    assert_eq!(json["snapshots_deleted"], 0);

    let (status, json) = call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/cleanup?retention_days=3"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retention_days"], 3);
}

#[tokio::test]
async fn cleanup_beyond_maximum_retention_is_400() {
    let st = make_state();
    let tenant = TenantId::new_random();

    let (status, json) = call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/cleanup?retention_days=4294967295"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");

    let max = psm_config::MAX_RETENTION_DAYS;
    let (status, json) = call(
        &st,
        "POST",
        &format!("/v1/tenants/{tenant}/cleanup?retention_days={max}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retention_days"], max);
}
