/// Authentication endpoints
use crate::{
    account::{
        AccountInfo, ChangePasswordRequest, LoginRequest, LoginResponse, PasswordResetConfirm,
        PasswordResetRequest, RefreshRequest, RegisterRequest, RequestContext, ResetRequestReceipt,
    },
    api::validated,
    auth::{AuthContext, PasswordChangeContext},
    context::AppContext,
    error::AuthResult,
    token::{TokenPair, TokenScope},
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

/// Build auth routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
        .route("/auth/password/change", post(change_password))
        .route("/auth/password/reset-request", post(reset_request))
        .route("/auth/password/reset-confirm", post(reset_confirm))
        .route("/auth/me", get(me))
}

async fn register(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> AuthResult<(StatusCode, Json<AccountInfo>)> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, None);

    let account = ctx.auth.register(&req, &request_ctx).await?;
    Ok((StatusCode::CREATED, Json(AccountInfo::from(&account))))
}

async fn login(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> AuthResult<Json<LoginResponse>> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, None);

    let response = ctx
        .auth
        .authenticate(&req.identifier, &req.password, &request_ctx)
        .await?;
    Ok(Json(response))
}

async fn refresh(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> AuthResult<Json<TokenPair>> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, None);

    Ok(Json(ctx.auth.refresh(&req.refresh_token, &request_ctx).await?))
}

async fn logout(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> AuthResult<StatusCode> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, None);

    ctx.auth.logout(&req.refresh_token, &request_ctx).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct RevokedSessions {
    revoked: u64,
}

async fn logout_all(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
) -> AuthResult<Json<RevokedSessions>> {
    let request_ctx = RequestContext::from_headers(&headers, Some(auth.account_id.clone()));

    let revoked = ctx.auth.logout_all(&auth.account_id, &request_ctx).await?;
    Ok(Json(RevokedSessions { revoked }))
}

/// Accepts restricted tokens, so a forced change can complete
async fn change_password(
    State(ctx): State<AppContext>,
    auth: PasswordChangeContext,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> AuthResult<StatusCode> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, Some(auth.account_id.clone()));
    if auth.scope == TokenScope::PasswordChange {
        tracing::debug!(account_id = %auth.account_id, "completing forced password change");
    }

    ctx.auth
        .change_password(&auth.account_id, &req.current_password, &req.new_password, &request_ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_request(
    State(ctx): State<AppContext>,
    Json(req): Json<PasswordResetRequest>,
) -> AuthResult<(StatusCode, Json<ResetRequestReceipt>)> {
    let req = validated(req)?;
    let receipt = ctx.auth.reset_password_request(&req.email).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn reset_confirm(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<PasswordResetConfirm>,
) -> AuthResult<StatusCode> {
    let req = validated(req)?;
    let request_ctx = RequestContext::from_headers(&headers, None);

    ctx.auth
        .reset_password_confirm(&req.token, &req.new_password, &request_ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    account_id: String,
    username: String,
    email: String,
    roles: Vec<String>,
    permissions: Vec<String>,
}

async fn me(auth: AuthContext) -> Json<MeResponse> {
    let claims = auth.claims;
    Json(MeResponse {
        account_id: claims.account_id,
        username: claims.username,
        email: claims.email,
        roles: claims.roles,
        permissions: claims.permissions,
    })
}
