use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use super::AdminQuery;
use crate::error::ControlPlaneError;
use crate::routes::middleware_auth::AdminUser;
use crate::routes::stream_headers;
use crate::snapshot::{self, resolve_environment};
use crate::state::AppState;
use crate::stream::{sse_response, AdminSource, ConnectionGuard, StreamSettings};

use std::sync::atomic::Ordering;

const DEFAULT_AUDIT_LIMIT: i64 = 120;

/// Full admin control-plane snapshot: raw records, audit tail, health
pub async fn snapshot(
    State(state): State<AppState>,
    AdminUser(_admin_id): AdminUser,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let environment = resolve_environment(query.environment.as_deref());
    let snapshot = snapshot::admin_snapshot(
        &state.db,
        &environment,
        query.audit_limit.unwrap_or(DEFAULT_AUDIT_LIMIT),
        state.open_streams.load(Ordering::Relaxed),
    )
    .await?;
    Ok(Json(snapshot))
}

/// Live admin control-plane stream
pub async fn stream(
    State(state): State<AppState>,
    AdminUser(_admin_id): AdminUser,
    Query(query): Query<AdminQuery>,
) -> impl IntoResponse {
    let environment = resolve_environment(query.environment.as_deref());
    let source = AdminSource {
        db: state.db.clone(),
        environment,
        audit_limit: query.audit_limit.unwrap_or(DEFAULT_AUDIT_LIMIT),
        open_streams: state.open_streams.clone(),
    };
    let guard = ConnectionGuard::new("admin", state.open_streams.clone());
    let sse = sse_response(source, StreamSettings::from_config(&state.config), guard);

    (stream_headers(), sse)
}
