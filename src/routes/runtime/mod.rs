pub mod routes;

use serde::Deserialize;

use crate::evaluation::EvaluationContext;

/// Query parameters shared by the runtime snapshot, decision and stream
/// endpoints
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeQuery {
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub anonymous_id: Option<String>,
}

impl RuntimeQuery {
    pub fn context(&self) -> EvaluationContext {
        EvaluationContext {
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            anonymous_id: self.anonymous_id.clone(),
        }
    }
}
