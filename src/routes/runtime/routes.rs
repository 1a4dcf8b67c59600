use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use super::RuntimeQuery;
use crate::error::ControlPlaneError;
use crate::evaluation::evaluate;
use crate::routes::stream_headers;
use crate::snapshot::{self, queries, resolve_environment};
use crate::state::AppState;
use crate::stream::{sse_response, ConnectionGuard, RuntimeSource, StreamSettings};

/// One-shot runtime snapshot for request/response consumers
pub async fn snapshot(
    State(state): State<AppState>,
    Query(query): Query<RuntimeQuery>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let environment = resolve_environment(query.environment.as_deref());
    let snapshot =
        snapshot::runtime_snapshot(&state.db, &environment, &query.context(), false).await?;
    Ok(Json(snapshot))
}

/// Synchronous decision query for a single flag key, for callers that do not
/// need a live subscription
pub async fn decide(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<RuntimeQuery>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let environment = resolve_environment(query.environment.as_deref());
    let mut records = queries::load_flag_records_for_key(&state.db, &environment, &key).await?;
    records.retain(|record| record.is_public);

    let decision = evaluate(&key, &records, &query.context(), Utc::now());
    Ok(Json(decision))
}

/// Live runtime configuration stream
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<RuntimeQuery>,
) -> impl IntoResponse {
    let environment = resolve_environment(query.environment.as_deref());
    let source = RuntimeSource {
        db: state.db.clone(),
        environment,
        context: query.context(),
    };
    let guard = ConnectionGuard::new("runtime", state.open_streams.clone());
    let sse = sse_response(source, StreamSettings::from_config(&state.config), guard);

    (stream_headers(), sse)
}
