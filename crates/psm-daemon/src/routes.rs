//! Axum router and all HTTP handlers for psm-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use psm_reconcile::{RecordError, RecordStore, RunError, StoreError};
use psm_schemas::{
    Collection, CollectionId, CollectionScope, Identity, ImportStats, PropertyRecord,
    RecordAction, RunStats, TenantId,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::{
    api_types::{
        CancelResponse, CleanupParams, CleanupResponse, CreateCollectionRequest, ErrorResponse,
        HealthResponse, StatusResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router<S>(state: Arc<AppState<S>>) -> Router
where
    S: RecordStore + 'static,
{
    Router::new()
        .route("/v1/health", get(health::<S>))
        .route("/v1/status", get(status_handler::<S>))
        .route("/v1/stream", get(stream::<S>))
        .route(
            "/v1/tenants/:tenant/collections",
            post(create_collection::<S>).get(list_collections::<S>),
        )
        .route(
            "/v1/tenants/:tenant/collections/:collection",
            delete(deactivate_collection::<S>),
        )
        .route(
            "/v1/tenants/:tenant/sources/:source/import",
            post(import::<S>),
        )
        .route(
            "/v1/tenants/:tenant/sources/:source/properties",
            get(list_source_properties::<S>),
        )
        .route("/v1/tenants/:tenant/sync/:source/:target", post(sync::<S>))
        .route(
            "/v1/tenants/:tenant/targets/:target/cancel",
            post(cancel::<S>),
        )
        .route(
            "/v1/tenants/:tenant/targets/:target/properties",
            get(list_properties::<S>),
        )
        .route(
            "/v1/tenants/:tenant/targets/:target/properties/:identity",
            patch(edit_property::<S>),
        )
        .route(
            "/v1/tenants/:tenant/targets/:target/properties/:identity/accept-source/:source",
            post(accept_source::<S>),
        )
        .route("/v1/tenants/:tenant/cleanup", post(cleanup::<S>))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Error response: status code plus [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                kind: kind.to_string(),
                stats: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, kind) = match &e {
            StoreError::CollectionNotFound(_) => (StatusCode::NOT_FOUND, "collection_not_found"),
            StoreError::WrongKind { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "wrong_kind"),
            StoreError::Inactive(_) => (StatusCode::UNPROCESSABLE_ENTITY, "collection_inactive"),
            StoreError::RecordNotFound(_) => (StatusCode::NOT_FOUND, "record_not_found"),
            StoreError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
            StoreError::StaleWrite { .. } => (StatusCode::CONFLICT, "stale_write"),
            StoreError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };
        ApiError::new(status, kind, e.to_string())
    }
}

impl From<RecordError> for ApiError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Store(inner) => inner.into(),
            RecordError::Encoding(inner) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "encoding", inner.to_string())
            }
            RecordError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "record_not_found", e.to_string())
            }
            RecordError::InvalidPatch(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_patch", e.to_string())
            }
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::RunInProgress(_) => {
                ApiError::new(StatusCode::CONFLICT, "run_in_progress", e.to_string())
            }
            RunError::CollectionUnavailable { ref stats, .. } => {
                let mut err = ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "collection_unavailable",
                    e.to_string(),
                );
                err.body.stats = Some((**stats).clone());
                err
            }
            RunError::Store(inner) => inner.into(),
            RunError::Record { identity, error } => {
                let mut err = ApiError::from(error);
                err.body.error = format!("record '{identity}': {}", err.body.error);
                err
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health  GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn health<S: RecordStore>(State(st): State<Arc<AppState<S>>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

pub(crate) async fn status_handler<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    Json(StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        active_runs: st.active_scopes(),
    })
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

pub(crate) async fn create_collection<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path(tenant): Path<TenantId>,
    Json(req): Json<CreateCollectionRequest>,
) -> Result<(StatusCode, Json<Collection>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "collection name must not be empty",
        ));
    }
    let ctx = st.context(tenant);
    let c = st.engine.create_collection(&ctx, name, req.kind).await?;
    Ok((StatusCode::CREATED, Json(c)))
}

pub(crate) async fn list_collections<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path(tenant): Path<TenantId>,
) -> Result<Json<Vec<Collection>>, ApiError> {
    let ctx = st.context(tenant);
    Ok(Json(st.engine.list_collections(&ctx).await?))
}

/// Soft delete: the collection is marked inactive and its rows are kept.
///
/// 409 while a run holds the collection.
pub(crate) async fn deactivate_collection<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, collection)): Path<(TenantId, CollectionId)>,
) -> Result<Json<Collection>, ApiError> {
    let scope = CollectionScope::new(tenant, collection);
    let Some(active) = st.begin_active(scope) else {
        return Err(RunError::RunInProgress(scope).into());
    };
    let ctx = st.context(tenant);
    let res = st.engine.deactivate_collection(&ctx, collection).await;
    drop(active);

    let c = res?;
    let _ = st.bus.send(BusMsg::LogLine {
        level: "INFO".to_string(),
        msg: format!("{} collection {collection} deactivated", c.kind.as_str()),
    });
    Ok(Json(c))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub(crate) async fn list_source_properties<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, source)): Path<(TenantId, CollectionId)>,
) -> Result<Json<Vec<PropertyRecord>>, ApiError> {
    let ctx = st.context(tenant);
    Ok(Json(st.engine.list_source(&ctx, source).await?))
}

// ---------------------------------------------------------------------------
// POST /v1/tenants/:tenant/sources/:source/import
// ---------------------------------------------------------------------------

/// Body: a JSON array of records, or an object with a `data` array.
pub(crate) async fn import<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, source)): Path<(TenantId, CollectionId)>,
    Json(doc): Json<Value>,
) -> Result<Json<ImportStats>, ApiError> {
    let raws = psm_ingest::into_records(doc)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_document", e.to_string()))?;
    let ctx = st.context(tenant);
    let stats = st.engine.import(&ctx, source, &raws).await?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// POST /v1/tenants/:tenant/sync/:source/:target
// ---------------------------------------------------------------------------

/// Run a reconciliation and return its stats.
///
/// 409 when a run already holds the target, 422 when either collection
/// cannot be opened (the failed run is still logged).
pub(crate) async fn sync<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, source, target)): Path<(TenantId, CollectionId, CollectionId)>,
) -> Result<Json<RunStats>, ApiError> {
    let scope = CollectionScope::new(tenant, target);
    let Some(active) = st.begin_active(scope) else {
        return Err(RunError::RunInProgress(scope).into());
    };

    let ctx = st.context(tenant);
    let _ = st.bus.send(BusMsg::RunStarted {
        tenant_id: tenant,
        source_id: source,
        target_id: target,
    });

    let res = st.engine.reconcile(&ctx, source, target, &active.cancel).await;
    drop(active);

    match res {
        Ok(stats) => {
            for o in stats
                .outcomes
                .iter()
                .filter(|o| o.action == RecordAction::SkippedConflict)
            {
                let _ = st.bus.send(BusMsg::Conflict {
                    tenant_id: tenant,
                    target_id: target,
                    identity: o.identity.clone(),
                });
            }
            let _ = st.bus.send(BusMsg::run_finished(tenant, target, &stats));
            info!(run_id = %stats.run_id, outcome = stats.outcome.as_str(), "sync");
            Ok(Json(stats))
        }
        Err(e) => {
            if let RunError::CollectionUnavailable { stats, .. } = &e {
                let _ = st.bus.send(BusMsg::run_finished(tenant, target, stats));
            }
            warn!(tenant = %tenant, target = %target, error = %e, "sync refused or failed");
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/tenants/:tenant/targets/:target/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, target)): Path<(TenantId, CollectionId)>,
) -> impl IntoResponse {
    let cancelled = st.cancel_active(CollectionScope::new(tenant, target));
    if cancelled {
        let _ = st.bus.send(BusMsg::LogLine {
            level: "WARN".to_string(),
            msg: format!("cancel requested for target {target}"),
        });
    }
    Json(CancelResponse { cancelled })
}

// ---------------------------------------------------------------------------
// Target properties
// ---------------------------------------------------------------------------

pub(crate) async fn list_properties<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, target)): Path<(TenantId, CollectionId)>,
) -> Result<Json<Vec<PropertyRecord>>, ApiError> {
    let ctx = st.context(tenant);
    Ok(Json(st.engine.list_target(&ctx, target).await?))
}

/// Out-of-band edit. Body: JSON object shallow-merged into the payload.
pub(crate) async fn edit_property<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, target, identity)): Path<(TenantId, CollectionId, String)>,
    Json(patch): Json<Value>,
) -> Result<Json<PropertyRecord>, ApiError> {
    let ctx = st.context(tenant);
    let rec = st
        .engine
        .edit_target(&ctx, target, &Identity::new(identity), &patch)
        .await?;
    Ok(Json(rec))
}

pub(crate) async fn accept_source<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path((tenant, target, identity, source)): Path<(TenantId, CollectionId, String, CollectionId)>,
) -> Result<Json<PropertyRecord>, ApiError> {
    let ctx = st.context(tenant);
    let rec = st
        .engine
        .accept_source(&ctx, source, target, &Identity::new(identity))
        .await?;
    let _ = st.bus.send(BusMsg::LogLine {
        level: "INFO".to_string(),
        msg: format!("source accepted for '{}' on target {target}", rec.identity),
    });
    Ok(Json(rec))
}

// ---------------------------------------------------------------------------
// POST /v1/tenants/:tenant/cleanup
// ---------------------------------------------------------------------------

pub(crate) async fn cleanup<S: RecordStore>(
    State(st): State<Arc<AppState<S>>>,
    Path(tenant): Path<TenantId>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let retention_days = params.retention_days.unwrap_or(st.defaults.retention_days);
    psm_config::check_retention_days(retention_days)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", e.to_string()))?;
    let ctx = st.context(tenant).with_retention_days(retention_days);
    let deleted = st.engine.cleanup(&ctx, ctx.now()).await?;
    Ok(Json(CleanupResponse {
        snapshots_deleted: deleted,
        retention_days,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream<S: RecordStore>(State(st): State<Arc<AppState<S>>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
