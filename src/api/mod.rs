/// API routes and handlers
pub mod admin;
pub mod auth;
pub mod middleware;

use crate::{context::AppContext, error::{AuthError, AuthResult}};
use axum::Router;
use validator::Validate;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new().merge(auth::routes()).merge(admin::routes())
}

/// Run `validator` rules on a request body
pub(crate) fn validated<T: Validate>(body: T) -> AuthResult<T> {
    body.validate()
        .map_err(|e| AuthError::Validation(e.to_string()))?;
    Ok(body)
}
