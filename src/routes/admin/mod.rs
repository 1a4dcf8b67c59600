pub mod routes;

use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct AdminQuery {
    pub environment: Option<String>,
    pub audit_limit: Option<i64>,
}
