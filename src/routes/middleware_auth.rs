use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

/// Extractor for the authenticated admin, injected by require_admin
pub struct AdminUser(pub Uuid);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Uuid>()
            .copied()
            .map(AdminUser)
            .ok_or((StatusCode::UNAUTHORIZED, "missing admin"))
    }
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct Claims {
    sub: String,
    role: String,
    exp: usize,
    iat: usize,
}

/// Gate for the admin control-plane surface. Token issuance lives outside
/// this service; the engine only verifies the admin role claim. The secret is
/// validated at startup in Config::from_env.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let token = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return Err((StatusCode::UNAUTHORIZED, "missing token"));
        }
    };

    let token_data = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(error = %e, "JWT decode error");
            return Err((StatusCode::UNAUTHORIZED, "invalid token"));
        }
    };

    if token_data.claims.role != "admin" {
        return Err((StatusCode::FORBIDDEN, "admin role required"));
    }

    match Uuid::parse_str(&token_data.claims.sub) {
        Ok(user_id) => {
            req.extensions_mut().insert(user_id);
            Ok(next.run(req).await)
        }
        Err(_) => Err((StatusCode::UNAUTHORIZED, "invalid subject")),
    }
}
