//! Resolving the requesting user.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tether_state::User;
use tracing::debug;

use crate::ApiState;
use crate::handlers::error_response;

/// Header carrying the caller's email.
pub const USER_HEADER: &str = "x-tether-user";

/// The registered user a request acts on behalf of.
pub struct RequestUser(pub User);

impl FromRequestParts<ApiState> for RequestUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let Some(email) = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|email| !email.is_empty())
        else {
            return Err(unauthorized());
        };

        match state.broker.store().get_user(email) {
            Ok(Some(user)) => Ok(RequestUser(user)),
            Ok(None) => {
                debug!(%email, "request from unknown user");
                Err(unauthorized())
            }
            Err(e) => Err(error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()),
        }
    }
}

fn unauthorized() -> Response {
    error_response("unknown or missing user", StatusCode::UNAUTHORIZED).into_response()
}
