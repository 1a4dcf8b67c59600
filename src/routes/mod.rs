use axum::{
    http::{header, HeaderName},
    middleware,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;

mod admin;
mod health;
mod middleware_auth;
mod runtime;

pub use health::health;

use crate::state::AppState;

/// Headers every stream response carries so intermediary proxies neither
/// buffer nor cache the event stream
pub fn stream_headers() -> [(HeaderName, &'static str); 2] {
    [
        (header::CACHE_CONTROL, "no-store"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ]
}

pub fn routes(state: AppState) -> Router {
    let runtime_router = Router::new()
        .route("/snapshot", get(runtime::routes::snapshot))
        .route("/flags/{key}", get(runtime::routes::decide))
        .route("/stream", get(runtime::routes::stream))
        .layer(CorsLayer::permissive());

    let admin_router = Router::new()
        .route("/control-plane", get(admin::routes::snapshot))
        .route("/control-plane/stream", get(admin::routes::stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_auth::require_admin,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/runtime", runtime_router)
        .nest("/admin", admin_router)
        .with_state(state)
}

async fn root() -> &'static str {
    "control-plane decision service"
}
