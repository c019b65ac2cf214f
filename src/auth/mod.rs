/*!
 * # Authentication
 *
 * Every API route sits behind an HS256 JWT bearer token. The token carries the
 * principal id (`sub`) and a single role. Handlers receive the principal as an
 * [`AuthUser`] extractor; role gates are attached per router with
 * [`AuthRouterExt::with_roles`].
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::errors::ServiceError;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

/// Roles allowed to mutate invoice status and remove products.
pub const BACK_OFFICE: &[Role] = &[Role::Admin, Role::Manager];

/// Claim structure for JWT tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated principal extracted from the bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientPermissions => ServiceError::Forbidden(err.to_string()),
            AuthError::TokenCreation(msg) => ServiceError::InternalError(msg),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").finish_non_exhaustive()
    }
}

impl AuthService {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    pub fn issue_token(
        &self,
        user_id: &str,
        role: Role,
        ttl: ChronoDuration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?
            .claims;

        Ok(AuthUser {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Validates the bearer token and stores the [`AuthUser`] in request extensions.
pub async fn auth_middleware(mut request: Request, next: Next) -> Result<Response, ServiceError> {
    let auth_service = request
        .extensions()
        .get::<Arc<AuthService>>()
        .cloned()
        .ok_or_else(|| ServiceError::InternalError("Authentication service not available".into()))?;

    let token = bearer_token(request.headers()).ok_or(AuthError::MissingToken)?;
    let user = auth_service.validate_token(token)?;
    debug!(user_id = %user.user_id, role = %user.role, "authenticated request");

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Rejects principals whose role is not in the allowed set.
pub async fn role_middleware(
    State(allowed): State<Arc<[Role]>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingToken)?;

    if !user.has_any_role(&allowed) {
        return Err(AuthError::InsufficientPermissions);
    }
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Extension methods for Router to add auth middleware
pub trait AuthRouterExt {
    fn with_auth(self) -> Self;
    fn with_roles(self, roles: &[Role]) -> Self;
}

impl<S> AuthRouterExt for axum::Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self) -> Self {
        self.layer(axum::middleware::from_fn(auth_middleware))
    }

    fn with_roles(self, roles: &[Role]) -> Self {
        let allowed: Arc<[Role]> = Arc::from(roles);
        self.layer(axum::middleware::from_fn_with_state(allowed, role_middleware))
            .with_auth()
    }
}
