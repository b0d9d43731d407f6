use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

/// The verified caller, injected into request extensions by [`require_auth`].
///
/// Token issuance, password hashing, and SSO live outside this service; the
/// middleware only verifies what the auth service minted.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Middleware gating every route except `/api/health`: extracts the Bearer
/// token, verifies the HS256 signature and expiry, and injects a `Principal`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::Unauthenticated("missing authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthenticated("authorization header must be a bearer token".into()))?;

    let key = DecodingKey::from_secret(state.config.auth.jwt_secret.as_bytes());
    let data = decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
        .map_err(|e| ApiError::Unauthenticated(format!("invalid token: {e}")))?;

    let user_id = Uuid::parse_str(&data.claims.sub)
        .map_err(|_| ApiError::Unauthenticated("token subject is not a user id".into()))?;

    request.extensions_mut().insert(Principal { user_id });
    Ok(next.run(request).await)
}
