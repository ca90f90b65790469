//! Pools and the (user, pool, kind) permission tuples attached to them.

use std::collections::HashMap;

use fleet_core::model::{Permission, Pool, PoolInfo, PoolPermissions, UserPermissions};
use uuid::Uuid;

use super::error::{map_unique_violation, StoreError};
use super::Store;

impl Store {
    pub async fn create_pool(&self, name: &str) -> Result<Pool, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::Invalid("pool name must not be empty".to_string()));
        }
        let id: Uuid = sqlx::query_scalar("INSERT INTO pools (pool_name) VALUES ($1) RETURNING id")
            .bind(name)
            .fetch_one(self.pool())
            .await?;
        Ok(Pool { id, name: name.to_string() })
    }

    pub async fn get_pool(&self, id: Uuid) -> Result<Pool, StoreError> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT id, pool_name FROM pools WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        let (id, name) = row.ok_or_else(|| StoreError::not_found("pool", id))?;
        Ok(Pool { id, name })
    }

    pub async fn delete_pool(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM pools WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("pool", id));
        }
        Ok(())
    }

    pub async fn add_permission(
        &self,
        pool_id: Uuid,
        user_id: &str,
        permission: Permission,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO permissions (user_id, pool_id, permission) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(pool_id)
            .bind(permission)
            .execute(self.pool())
            .await
            .map_err(|e| map_unique_violation(e, "permission"))?;
        Ok(())
    }

    pub async fn remove_permission(
        &self,
        pool_id: Uuid,
        user_id: &str,
        permission: Permission,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM permissions WHERE user_id = $1 AND pool_id = $2 AND permission = $3",
        )
        .bind(user_id)
        .bind(pool_id)
        .bind(permission)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("permission", format!("{user_id}@{pool_id}")));
        }
        Ok(())
    }

    /// Every pool the user can touch, grouped by permission kind, with live
    /// agent/session/user counts per pool.
    pub async fn get_user_permissions(
        &self,
        user_id: &str,
    ) -> Result<UserPermissions, StoreError> {
        let rows: Vec<(Uuid, Permission, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT permissions.pool_id, permissions.permission, pools.pool_name,
                    COUNT(DISTINCT sessions.id) AS session_count,
                    COUNT(DISTINCT agents.id) AS agent_count,
                    (SELECT COUNT(DISTINCT p.user_id) FROM permissions p
                     WHERE p.pool_id = permissions.pool_id) AS user_count
             FROM permissions
             JOIN pools ON pools.id = permissions.pool_id
             LEFT JOIN agents ON agents.pool_id = pools.id AND agents.state = 'active'
             LEFT JOIN sessions ON sessions.agent_id = agents.id AND sessions.state = 'active'
             WHERE permissions.user_id = $1
             GROUP BY permissions.pool_id, permissions.permission, pools.pool_name",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        let mut result = UserPermissions::default();
        for (pool_id, permission, name, session_count, agent_count, user_count) in rows {
            result.permissions.entry(permission).or_default().push(PoolInfo {
                id: pool_id,
                name,
                session_count,
                agent_count,
                user_count,
            });
        }
        Ok(result)
    }

    /// Which users hold which permission kinds on one pool.
    pub async fn get_pool_permissions(
        &self,
        pool_id: Uuid,
    ) -> Result<PoolPermissions, StoreError> {
        let rows: Vec<(String, Permission)> = sqlx::query_as(
            "SELECT user_id, permission FROM permissions WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(self.pool())
        .await?;

        let mut user_ids: HashMap<String, Vec<Permission>> = HashMap::new();
        for (user_id, permission) in rows {
            user_ids.entry(user_id).or_default().push(permission);
        }
        Ok(PoolPermissions { user_ids })
    }
}
