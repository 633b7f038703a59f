//! Authentication middleware and identity resolution

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use livechat_shared::UserRole;
use sqlx::PgPool;

use super::jwt::{JwtError, JwtManager};
use crate::error::{ApiError, ApiResult};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: UserRole,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }

    /// Reject callers that are not operators or supervisors
    pub fn require_privileged(&self) -> ApiResult<()> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn require_role(&self, role: UserRole) -> ApiResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// State needed to authenticate requests and WebSocket connections
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

impl AuthState {
    pub fn new(jwt_manager: JwtManager, pool: PgPool) -> Self {
        Self { jwt_manager, pool }
    }

    /// Verify a token and resolve the caller's role
    ///
    /// Identities unknown to the profile cache are rejected.
    pub async fn resolve(&self, token: &str) -> ApiResult<Identity> {
        let claims = self.jwt_manager.validate_token(token).map_err(|e| {
            tracing::debug!(error = %e, "Token validation failed");
            match e {
                JwtError::Expired | JwtError::Invalid | JwtError::Validation(_) => {
                    ApiError::InvalidToken
                }
                JwtError::Encoding(_) => ApiError::Internal,
            }
        })?;

        let row: Option<(UserRole, Option<String>)> =
            sqlx::query_as("SELECT role, display_name FROM users WHERE id = $1")
                .bind(claims.sub)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((role, display_name)) => Ok(Identity {
                user_id: claims.sub,
                role,
                display_name,
            }),
            None => {
                tracing::warn!(user_id = claims.sub, "Authentication failed: unknown user");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a valid bearer token, inserting the resolved [`Identity`] as an extension
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req).ok_or(ApiError::Unauthorized)?.to_string();
    let identity = auth_state.resolve(&token).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
