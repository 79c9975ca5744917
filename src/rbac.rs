/// Permission resolution
///
/// Effective permissions are the deduplicated union over an account's
/// active, non-deleted role assignments of non-deleted roles. Nothing is
/// cached; every call reads current state.
use crate::error::AuthResult;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;

/// Roles and permissions granted to an account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAccess {
    /// Role slugs, ordered by level then slug
    pub roles: Vec<String>,
    pub permissions: BTreeSet<String>,
}

/// Resolve roles and permissions on an existing connection, so rotation can
/// do it inside its transaction
pub async fn resolve_access(conn: &mut SqliteConnection, account_id: &str) -> AuthResult<ResolvedAccess> {
    let role_rows = sqlx::query(
        r#"
        SELECT r.id, r.slug
        FROM role_assignment ra
        JOIN role r ON r.id = ra.role_id
        WHERE ra.account_id = ?1
          AND ra.active = 1
          AND ra.deleted_at IS NULL
          AND r.deleted_at IS NULL
        ORDER BY r.level DESC, r.slug ASC
        "#,
    )
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut access = ResolvedAccess::default();

    for row in role_rows {
        let role_id: String = row.try_get("id")?;
        access.roles.push(row.try_get("slug")?);

        let slugs: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT p.slug
            FROM role_permission rp
            JOIN permission p ON p.id = rp.permission_id
            WHERE rp.role_id = ?1
            "#,
        )
        .bind(&role_id)
        .fetch_all(&mut *conn)
        .await?;

        access.permissions.extend(slugs);
    }

    Ok(access)
}

/// Read-only resolver over the pool
#[derive(Clone)]
pub struct PermissionResolver {
    db: SqlitePool,
}

impl PermissionResolver {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Effective permission slugs for an account
    pub async fn resolve(&self, account_id: &str) -> AuthResult<BTreeSet<String>> {
        Ok(self.resolve_access(account_id).await?.permissions)
    }

    /// Role slugs and permission slugs for an account
    pub async fn resolve_access(&self, account_id: &str) -> AuthResult<ResolvedAccess> {
        let mut conn = self.db.acquire().await?;
        resolve_access(&mut conn, account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn set(slugs: &[&str]) -> BTreeSet<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_union_is_deduplicated_and_order_independent() {
        let (pool, _dir) = testutil::setup_pool().await;
        let alice = testutil::insert_account(&pool, "alice", "alice@example.com").await;
        let dave = testutil::insert_account(&pool, "dave", "dave@example.com").await;

        let operator = testutil::seed_role(&pool, "operator", 10, &["incidents.read", "vehicles.read"]).await;
        let supervisor =
            testutil::seed_role(&pool, "supervisor", 20, &["vehicles.read", "incidents.assign"]).await;

        // Same roles, assigned in opposite order
        testutil::assign_role(&pool, &alice, &operator).await;
        testutil::assign_role(&pool, &alice, &supervisor).await;
        testutil::assign_role(&pool, &dave, &supervisor).await;
        testutil::assign_role(&pool, &dave, &operator).await;

        let resolver = PermissionResolver::new(pool.clone());
        let expected = set(&["incidents.assign", "incidents.read", "vehicles.read"]);

        assert_eq!(resolver.resolve(&alice).await.unwrap(), expected);
        assert_eq!(resolver.resolve(&dave).await.unwrap(), expected);

        let access = resolver.resolve_access(&alice).await.unwrap();
        assert_eq!(access.roles, vec!["supervisor".to_string(), "operator".to_string()]);
    }

    #[tokio::test]
    async fn test_inactive_and_deleted_assignments_are_ignored() {
        let (pool, _dir) = testutil::setup_pool().await;
        let erin = testutil::insert_account(&pool, "erin", "erin@example.com").await;

        let dispatcher = testutil::seed_role(&pool, "dispatcher", 10, &["incidents.read"]).await;
        let auditor = testutil::seed_role(&pool, "auditor", 10, &["audit.read"]).await;
        let retired = testutil::seed_role(&pool, "retired", 10, &["legacy.write"]).await;

        testutil::assign_role(&pool, &erin, &dispatcher).await;
        testutil::assign_role(&pool, &erin, &auditor).await;
        testutil::assign_role(&pool, &erin, &retired).await;

        sqlx::query("UPDATE role_assignment SET active = 0 WHERE account_id = ?1 AND role_id = ?2")
            .bind(&erin)
            .bind(&auditor)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE role SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?1")
            .bind(&retired)
            .execute(&pool)
            .await
            .unwrap();

        let resolver = PermissionResolver::new(pool.clone());
        let access = resolver.resolve_access(&erin).await.unwrap();
        assert_eq!(access.roles, vec!["dispatcher".to_string()]);
        assert_eq!(access.permissions, set(&["incidents.read"]));
    }

    #[tokio::test]
    async fn test_changes_are_visible_immediately() {
        let (pool, _dir) = testutil::setup_pool().await;
        let frank = testutil::insert_account(&pool, "frank", "frank@example.com").await;
        let resolver = PermissionResolver::new(pool.clone());

        assert!(resolver.resolve(&frank).await.unwrap().is_empty());

        let role = testutil::seed_role(&pool, "patrol", 5, &["sectors.read"]).await;
        testutil::assign_role(&pool, &frank, &role).await;
        assert_eq!(resolver.resolve(&frank).await.unwrap(), set(&["sectors.read"]));

        sqlx::query("UPDATE role_assignment SET deleted_at = CURRENT_TIMESTAMP WHERE account_id = ?1")
            .bind(&frank)
            .execute(&pool)
            .await
            .unwrap();
        assert!(resolver.resolve(&frank).await.unwrap().is_empty());
    }
}
