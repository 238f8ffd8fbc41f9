/// Bearer-token check for the `/v1` routes.
///
/// Placeholder policy: any token at least `auth.min_key_length` characters
/// long is accepted. There is no credential registry behind it.
use crate::config::AuthConfig;
use crate::error::ApiError;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// The caller's API key, extracted from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct ApiKey(pub String);

impl<S> FromRequestParts<S> for ApiKey
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(ApiError::Unauthorized("Missing authorization header"))?
            .to_str()
            .map_err(|_| ApiError::Unauthorized("Invalid authorization header"))?;

        verify_bearer(header, config.min_key_length).map(ApiKey)
    }
}

/// Validate an `Authorization` header value and return the token.
pub fn verify_bearer(header: &str, min_key_length: usize) -> Result<String, ApiError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized("Invalid authorization header"))?;

    if token.chars().count() < min_key_length.max(1) {
        return Err(ApiError::Unauthorized("Invalid API key"));
    }

    Ok(token.to_string())
}
