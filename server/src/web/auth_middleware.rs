use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::auth::identity::{Identity, Role};
use crate::auth::token::{Claims, validate_session_token};

use super::app_state::AppState;

/// The session token from `Authorization: Bearer` or, failing that, the session cookie.
fn session_token(parts: &Parts, cookie_name: &str) -> Option<String> {
    if let Some(value) = parts.headers.get(AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }

    CookieJar::from_headers(&parts.headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
}

fn claims(parts: &Parts, state: &AppState) -> Option<Result<Claims, jsonwebtoken::errors::Error>> {
    session_token(parts, &state.config.auth.cookie_name)
        .map(|token| validate_session_token(&token, &state.config.auth.jwt_secret))
}

/// Caller identity; anonymous when no valid session is presented. Never rejects.
pub struct MaybeUser(pub Identity);

impl FromRequestParts<Arc<AppState>> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = match claims(parts, state) {
            Some(Ok(claims)) => Identity::User {
                user_id: claims.sub,
                role: claims.role,
            },
            _ => Identity::Anonymous,
        };
        Ok(MaybeUser(identity))
    }
}

/// Extractor for moderator endpoints: 401 without a valid session, 403 without
/// the admin role.
pub struct AdminUser {
    pub user_id: String,
}

impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let claims = claims(parts, state)
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Not authenticated").into_response())?
            .map_err(|_| {
                (StatusCode::UNAUTHORIZED, "Invalid or expired session").into_response()
            })?;

        if claims.role != Role::Admin {
            return Err((StatusCode::FORBIDDEN, "Admin role required").into_response());
        }

        Ok(AdminUser {
            user_id: claims.sub,
        })
    }
}
