//! Session rows: request, assignment, cancellation, lookup.

use fleet_core::model::{
    Connection, QueuedSession, Session, SessionGpu, SessionRequirements, SessionState,
};
use sqlx::types::Json;
use uuid::Uuid;

use super::error::StoreError;
use super::iterator::QueuedSessionIterator;
use super::{link_key_values, CrossRefTable, Store};

pub(crate) const SELECT_SESSION: &str =
    "SELECT id, state, address, version, pool_id, agent_id, gpus, updated_at FROM sessions";

#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub id: Uuid,
    pub state: SessionState,
    pub address: Option<String>,
    pub version: String,
    pub pool_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub gpus: Option<Json<Vec<SessionGpu>>>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SessionRow {
    pub(crate) fn into_session(self, connections: Vec<Connection>) -> Session {
        Session {
            id: self.id,
            state: self.state,
            address: self.address,
            version: self.version,
            pool_id: self.pool_id,
            agent_id: self.agent_id,
            gpus: self.gpus.map(|g| g.0).unwrap_or_default(),
            connections,
            updated_at: Some(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: Uuid,
    pid: i64,
    process_name: String,
    exit_code: Option<i32>,
}

impl Store {
    /// Insert a queued session and its label/toleration cross-references in
    /// one transaction. Returns the assigned id.
    pub async fn request_session(
        &self,
        requirements: &SessionRequirements,
    ) -> Result<Uuid, StoreError> {
        if requirements.gpus.is_empty() {
            return Err(StoreError::Invalid(
                "session requirements must name at least one GPU".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO sessions (state, version, pool_id, requirements, vram_required)
             VALUES ('queued', $1, $2, $3, $4)
             RETURNING id",
        )
        .bind(&requirements.version)
        .bind(requirements.pool_id)
        .bind(Json(requirements))
        .bind(requirements.vram_required() as i64)
        .fetch_one(&mut *tx)
        .await?;

        link_key_values(&mut tx, CrossRefTable::SessionMatchLabels, id, &requirements.match_labels)
            .await?;
        link_key_values(&mut tx, CrossRefTable::SessionTolerates, id, &requirements.tolerates)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Commit a placement decision: deduct the session's VRAM requirement
    /// from the agent and move the session to `assigned`, mirroring the
    /// agent's address. Capacity was already checked by the scheduler; this
    /// only makes the decision durable.
    pub async fn assign_session(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        gpus: &[SessionGpu],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE agents SET
                vram_available = vram_available - (SELECT vram_required FROM sessions WHERE id = $1),
                updated_at = now()
             WHERE id = $2",
        )
        .bind(session_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("agent", agent_id));
        }

        let updated = sqlx::query(
            "UPDATE sessions SET
                agent_id = $1,
                state = 'assigned',
                address = (SELECT address FROM agents WHERE id = $1),
                gpus = $2,
                updated_at = now()
             WHERE id = $3 AND state = 'queued'",
        )
        .bind(agent_id)
        .bind(Json(gpus))
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("queued session", session_id));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Cancel a session. Unplaced sessions close immediately; placed ones
    /// move to `canceling` and wait for the owning agent's acknowledgement.
    /// Repeated calls are no-ops once the session is terminal.
    pub async fn cancel_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET
                state = CASE WHEN agent_id IS NULL
                            THEN 'closed'::session_state
                            ELSE 'canceling'::session_state
                        END,
                updated_at = now()
             WHERE id = $1 AND state NOT IN ('closed', 'failed')",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        let row: SessionRow = sqlx::query_as(&format!("{} WHERE id = $1", SELECT_SESSION))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("session", id))?;

        let connections = self.get_session_connections(id).await?;
        Ok(row.into_session(connections))
    }

    pub(crate) async fn get_session_connections(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<Connection>, StoreError> {
        let rows: Vec<ConnectionRow> = sqlx::query_as(
            "SELECT id, pid, process_name, exit_code FROM connections WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|c| Connection {
                id: c.id,
                pid: c.pid,
                process_name: c.process_name,
                exit_code: c.exit_code,
            })
            .collect())
    }

    pub async fn get_queued_session(&self, id: Uuid) -> Result<QueuedSession, StoreError> {
        let row: Option<(Uuid, Json<SessionRequirements>)> = sqlx::query_as(
            "SELECT id, requirements FROM sessions WHERE id = $1 AND state = 'queued'",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        let (id, requirements) =
            row.ok_or_else(|| StoreError::not_found("queued session", id))?;
        Ok(QueuedSession { id, requirements: requirements.0 })
    }

    /// Lazy iterator over queued sessions in submission order.
    pub fn get_queued_sessions(&self) -> QueuedSessionIterator {
        QueuedSessionIterator::new(self.clone())
    }
}
