use sqlx::PgPool;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    /// Number of currently open stream connections, reported in admin health
    pub open_streams: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(db: PgPool, config: Config) -> Self {
        AppState {
            db,
            config: Arc::new(config),
            open_streams: Arc::new(AtomicU64::new(0)),
        }
    }
}
