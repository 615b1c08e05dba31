use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use sqlx::Row;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::UserRole;
use crate::state::AppState;

/// The resolved caller, inserted as a request extension by
/// [`auth_middleware`]. This is the whole identity-service surface the rest
/// of the system sees.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: UserRole,
}

/// Resolve the `Authorization` API key to a user id and role. Keys are
/// stored hashed; the raw key never touches the database.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let api_key = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if api_key.is_empty() {
        return ApiError::Unauthorized.into_response();
    }

    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    let key_hash = hex::encode(hasher.finalize());

    let row = match sqlx::query("SELECT id, role FROM users WHERE api_key_hash = $1")
        .bind(&key_hash)
        .fetch_optional(&state.pool)
        .await
    {
        Ok(Some(row)) => row,
        Ok(None) => return ApiError::Unauthorized.into_response(),
        Err(e) => return ApiError::Database(e).into_response(),
    };

    let user = AuthUser {
        id: row.get("id"),
        role: row.get("role"),
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}
