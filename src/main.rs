mod config;
mod error;
mod evaluation;
mod routes;
mod snapshot;
mod state;
mod stream;

use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env();

    let db = PgPool::connect(&config.database_url)
        .await
        .expect("Error connecting DB");

    let addr = config.addr();
    let environment = config.environment.clone();
    let state = state::AppState::new(db, config);

    let app = routes::routes(state);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    tracing::info!(%addr, %environment, "control-plane service listening");

    axum::serve(listener, app).await.unwrap();
}
