use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, services::TokenStore, state::AppState, types::UserId};

/// Authenticated caller, inserted into request extensions by [`auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

#[derive(Debug)]
pub enum AuthRejection {
    /// Missing, malformed, unknown or expired token. Deliberately uniform.
    Unauthenticated,
    /// The token store could not be consulted.
    Unavailable(anyhow::Error),
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            AuthRejection::Unauthenticated => {
                AppError::Unauthorized("Unauthorized".to_string()).into_response()
            }
            AuthRejection::Unavailable(err) => AppError::InternalServerError(err).into_response(),
        }
    }
}

pub async fn auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthRejection> {
    let user_id = authenticate(request.headers(), state.tokens.as_ref()).await?;
    request.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(request).await)
}

/// Resolves the bearer token in `headers` to a user id.
pub async fn authenticate(
    headers: &HeaderMap,
    tokens: &dyn TokenStore,
) -> Result<UserId, AuthRejection> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .filter(|token| !token.is_empty())
        .ok_or(AuthRejection::Unauthenticated)?;

    match tokens.resolve(token).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(AuthRejection::Unauthenticated),
        Err(err) => {
            tracing::error!(error = %err, "Token store lookup failed");
            Err(AuthRejection::Unavailable(err))
        }
    }
}

pub fn parse_bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(rest.trim())
    } else {
        None
    }
}
