/// Admin API Endpoints
///
/// Account administration, gated by permission slugs carried in the
/// caller's access token.
use crate::{
    account::{audit, AccountInfo, AdminResetPasswordRequest, RequestContext, SetStatusRequest},
    api::validated,
    auth::AuthContext,
    context::AppContext,
    db::account::{LoginAttempt, SessionRecord},
    error::AuthResult,
    require_permission,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/admin/accounts/:id", get(get_account))
        .route("/admin/accounts/:id", delete(delete_account))
        .route("/admin/accounts/:id/reset-password", post(reset_password))
        .route("/admin/accounts/:id/status", post(set_status))
        .route("/admin/accounts/:id/unlock", post(unlock))
        .route("/admin/accounts/:id/sessions", get(list_sessions))
        .route("/admin/accounts/:id/revoke-sessions", post(revoke_sessions))
        .route("/admin/sessions/:token_id", get(session_status))
        .route("/admin/accounts/:id/login-attempts", get(login_attempts))
        .route("/admin/accounts/:id/permissions", get(permissions))
}

fn actor_ctx(auth: &AuthContext, headers: &HeaderMap) -> RequestContext {
    RequestContext::from_headers(headers, Some(auth.account_id.clone()))
}

async fn get_account(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AuthResult<Json<AccountInfo>> {
    require_permission!(auth, "accounts.read");

    let account = ctx.auth.accounts().get_account(&id).await?;
    Ok(Json(AccountInfo::from(&account)))
}

async fn delete_account(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AuthResult<StatusCode> {
    require_permission!(auth, "accounts.manage");

    ctx.auth.accounts().soft_delete(&id, &actor_ctx(&auth, &headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_password(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<AdminResetPasswordRequest>,
) -> AuthResult<StatusCode> {
    require_permission!(auth, "accounts.reset_password");
    let req = validated(req)?;

    ctx.auth
        .reset_password(&id, &req.new_password, &actor_ctx(&auth, &headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_status(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SetStatusRequest>,
) -> AuthResult<Json<AccountInfo>> {
    require_permission!(auth, "accounts.manage");

    let account = ctx
        .auth
        .accounts()
        .set_status(&id, req.status, &actor_ctx(&auth, &headers))
        .await?;
    Ok(Json(AccountInfo::from(&account)))
}

async fn unlock(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AuthResult<Json<AccountInfo>> {
    require_permission!(auth, "accounts.manage");

    let account = ctx.auth.accounts().unlock(&id, &actor_ctx(&auth, &headers)).await?;
    Ok(Json(AccountInfo::from(&account)))
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AuthResult<Json<Vec<SessionRecord>>> {
    require_permission!(auth, "accounts.read");

    Ok(Json(ctx.auth.sessions(&id).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    token_id: String,
    revoked: bool,
}

/// Unknown token ids report as revoked
async fn session_status(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(token_id): Path<String>,
) -> AuthResult<Json<SessionStatus>> {
    require_permission!(auth, "accounts.read");

    let revoked = ctx.auth.is_revoked(&token_id).await?;
    Ok(Json(SessionStatus { token_id, revoked }))
}

#[derive(Serialize)]
struct RevokedSessions {
    revoked: u64,
}

async fn revoke_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AuthResult<Json<RevokedSessions>> {
    require_permission!(auth, "sessions.revoke");

    let revoked = ctx.auth.logout_all(&id, &actor_ctx(&auth, &headers)).await?;
    Ok(Json(RevokedSessions { revoked }))
}

#[derive(Deserialize)]
struct AttemptsQuery {
    limit: Option<u32>,
}

async fn login_attempts(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
    Query(query): Query<AttemptsQuery>,
) -> AuthResult<Json<Vec<LoginAttempt>>> {
    require_permission!(auth, "audit.read");

    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(audit::recent_attempts(&ctx.db, &id, limit).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionsResponse {
    account_id: String,
    roles: Vec<String>,
    permissions: Vec<String>,
}

async fn permissions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> AuthResult<Json<PermissionsResponse>> {
    require_permission!(auth, "accounts.read");

    let access = ctx.resolver.resolve_access(&id).await?;
    Ok(Json(PermissionsResponse {
        account_id: id,
        roles: access.roles,
        permissions: access.permissions.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{self, TestApp};
    use crate::testutil::{self, DEFAULT_PASSWORD};
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    /// An admin with every account permission, returning its access token
    async fn admin_token(app: &TestApp) -> String {
        let admin = testutil::insert_account(&app.pool, "root", "root@example.com").await;
        let role = testutil::seed_role(
            &app.pool,
            "administrator",
            100,
            &[
                "accounts.read",
                "accounts.manage",
                "accounts.reset_password",
                "sessions.revoke",
                "audit.read",
            ],
        )
        .await;
        testutil::assign_role(&app.pool, &admin, &role).await;

        let login = app.login("root", DEFAULT_PASSWORD).await;
        login["accessToken"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_permission_required() {
        let app = test_support::app().await;
        let target = testutil::insert_account(&app.pool, "alice", "alice@example.com").await;
        let login = app.login("alice", DEFAULT_PASSWORD).await;
        let token = login["accessToken"].as_str().unwrap();

        let (status, body) = app
            .send(Method::POST, &format!("/admin/accounts/{}/unlock", target), Some(token), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Forbidden");
    }

    #[tokio::test]
    async fn test_admin_reset_and_status_flow() {
        let app = test_support::app().await;
        let token = admin_token(&app).await;
        let target = testutil::insert_account(&app.pool, "bob", "bob@example.com").await;

        let (status, _) = app
            .send(
                Method::POST,
                &format!("/admin/accounts/{}/reset-password", target),
                Some(&token),
                Some(json!({ "newPassword": "temporary secret" })),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let login = app.login("bob", "temporary secret").await;
        assert_eq!(login["passwordChangeRequired"], true);

        let (status, body) = app
            .send(
                Method::POST,
                &format!("/admin/accounts/{}/status", target),
                Some(&token),
                Some(json!({ "status": "BLOCKED" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "BLOCKED");
        assert_eq!(body["mustChangePassword"], true);
    }

    #[tokio::test]
    async fn test_attempts_and_permissions_reporting() {
        let app = test_support::app().await;
        let token = admin_token(&app).await;
        let target = testutil::insert_account(&app.pool, "carol", "carol@example.com").await;
        let role = testutil::seed_role(&app.pool, "dispatcher", 10, &["incidents.read"]).await;
        testutil::assign_role(&app.pool, &target, &role).await;

        app.send(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "identifier": "carol", "password": "wrong password" })),
        )
        .await;

        let (status, attempts) = app
            .send(
                Method::GET,
                &format!("/admin/accounts/{}/login-attempts?limit=10", target),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attempts.as_array().unwrap().len(), 1);
        assert_eq!(attempts[0]["failureReason"], "bad_password");
        assert_eq!(attempts[0]["success"], false);

        let (status, body) = app
            .send(
                Method::GET,
                &format!("/admin/accounts/{}/permissions", target),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roles"], json!(["dispatcher"]));
        assert_eq!(body["permissions"], json!(["incidents.read"]));
    }

    #[tokio::test]
    async fn test_revoke_and_delete() {
        let app = test_support::app().await;
        let token = admin_token(&app).await;
        let target = testutil::insert_account(&app.pool, "dave", "dave@example.com").await;
        let login = app.login("dave", DEFAULT_PASSWORD).await;

        let (status, sessions) = app
            .send(Method::GET, &format!("/admin/accounts/{}/sessions", target), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let token_id = sessions[0]["tokenId"].as_str().unwrap().to_string();
        assert_eq!(sessions.as_array().unwrap().len(), 1);

        let (status, body) = app
            .send(
                Method::POST,
                &format!("/admin/accounts/{}/revoke-sessions", target),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], 1);

        let (status, _) = app
            .send(
                Method::POST,
                "/auth/refresh",
                None,
                Some(json!({ "refreshToken": login["refreshToken"] })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, body) = app
            .send(Method::GET, &format!("/admin/sessions/{}", token_id), Some(&token), None)
            .await;
        assert_eq!(body["revoked"], true);

        let (status, _) = app
            .send(Method::DELETE, &format!("/admin/accounts/{}", target), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = app
            .send(Method::GET, &format!("/admin/accounts/{}", target), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
