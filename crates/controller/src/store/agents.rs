//! Agent rows: registration, reconciler updates, liveness sweeps, lookup.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::model::{total_vram, Agent, AgentRegistration, AgentState, AgentUpdate, Gpu};
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use super::error::StoreError;
use super::iterator::{AgentFilter, AgentIterator};
use super::sessions::{SessionRow, SELECT_SESSION};
use super::{link_key_values, CrossRefTable, Store};

const SELECT_AGENT: &str = "SELECT id, state, hostname, address, version, pool_id, gpus, \
     vram_available, updated_at FROM agents";

#[derive(sqlx::FromRow)]
pub(crate) struct AgentRow {
    pub id: Uuid,
    pub state: AgentState,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub pool_id: Option<Uuid>,
    pub gpus: Json<Vec<Gpu>>,
    pub vram_available: i64,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Insert (or, for a rejoining id, refresh) an agent row together with
    /// its label/taint cross-references, in one transaction. Cross-references
    /// are rebuilt from scratch so re-registration never duplicates them.
    pub async fn register_agent(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Uuid, StoreError> {
        let vram_total = total_vram(&registration.gpus) as i64;
        let mut tx = self.pool().begin().await?;

        let existing: Option<Uuid> = match registration.id {
            Some(id) => {
                sqlx::query_scalar("SELECT id FROM agents WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        let id: Uuid = match existing {
            Some(id) => {
                // Rejoin: keep whatever VRAM is still reserved by live
                // sessions assigned to this agent.
                sqlx::query_scalar(
                    "UPDATE agents SET
                        state = 'active',
                        hostname = $2,
                        address = $3,
                        version = $4,
                        pool_id = $5,
                        gpus = $6,
                        vram_available = $7 - COALESCE((
                            SELECT SUM(vram_required) FROM sessions
                            WHERE agent_id = $1 AND state IN ('assigned', 'active', 'canceling')
                        ), 0),
                        updated_at = now()
                     WHERE id = $1
                     RETURNING id",
                )
                .bind(id)
                .bind(&registration.hostname)
                .bind(&registration.address)
                .bind(&registration.version)
                .bind(registration.pool_id)
                .bind(Json(&registration.gpus))
                .bind(vram_total)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "INSERT INTO agents (state, hostname, address, version, pool_id, gpus, vram_available)
                     VALUES ('active', $1, $2, $3, $4, $5, $6)
                     RETURNING id",
                )
                .bind(&registration.hostname)
                .bind(&registration.address)
                .bind(&registration.version)
                .bind(registration.pool_id)
                .bind(Json(&registration.gpus))
                .bind(vram_total)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        sqlx::query("DELETE FROM agent_labels WHERE agent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agent_taints WHERE agent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        link_key_values(&mut tx, CrossRefTable::AgentLabels, id, &registration.labels).await?;
        link_key_values(&mut tx, CrossRefTable::AgentTaints, id, &registration.taints).await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent, StoreError> {
        let row: AgentRow = sqlx::query_as(&format!("{} WHERE id = $1", SELECT_AGENT))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("agent", id))?;
        self.hydrate_agent(row).await
    }

    /// Attach labels, taints, and live sessions to a base row.
    pub(crate) async fn hydrate_agent(&self, row: AgentRow) -> Result<Agent, StoreError> {
        let labels = self.load_key_values("agent_labels", "agent_id", row.id).await?;
        let taints = self.load_key_values("agent_taints", "agent_id", row.id).await?;

        let session_rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{} WHERE agent_id = $1 AND state NOT IN ('closed', 'failed') ORDER BY created_at ASC",
            SELECT_SESSION
        ))
        .bind(row.id)
        .fetch_all(self.pool())
        .await?;

        let sessions = session_rows
            .into_iter()
            .map(|s| s.into_session(Vec::new()))
            .collect();

        Ok(Agent {
            id: row.id,
            state: row.state,
            hostname: row.hostname,
            address: row.address,
            version: row.version,
            pool_id: row.pool_id,
            gpus: row.gpus.0,
            labels,
            taints,
            sessions,
            vram_available: row.vram_available.max(0) as u64,
            updated_at: row.updated_at,
        })
    }

    async fn load_key_values(
        &self,
        table: &str,
        owner_column: &str,
        owner_id: Uuid,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT kv.key, kv.value FROM {table} xref
             JOIN key_values kv ON kv.id = xref.key_value_id
             WHERE xref.{owner_column} = $1"
        ))
        .bind(owner_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Apply one reconciler tick's worth of agent-side changes in a single
    /// transaction: merge per-GPU metrics by index, apply session state
    /// transitions (restoring VRAM on terminal ones), upsert connections,
    /// and refresh the agent row's state and heartbeat.
    pub async fn update_agent(&self, update: &AgentUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let gpus: Option<Json<Vec<Gpu>>> =
            sqlx::query_scalar("SELECT gpus FROM agents WHERE id = $1 FOR UPDATE")
                .bind(update.id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut gpus = gpus
            .ok_or_else(|| StoreError::not_found("agent", update.id))?
            .0;

        for (index, metrics) in update.gpus.iter().enumerate() {
            if let Some(gpu) = gpus.get_mut(index) {
                gpu.metrics = metrics.clone();
            }
        }

        for (session_id, session_update) in &update.sessions {
            if session_update.state.is_terminal() {
                // Return the reservation before the state flips; the guard on
                // the session's current state keeps this from running twice.
                sqlx::query(
                    "UPDATE agents SET vram_available = vram_available + s.vram_required
                     FROM sessions s
                     WHERE s.id = $1 AND s.agent_id = agents.id
                       AND s.state IN ('assigned', 'active', 'canceling')",
                )
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE sessions SET state = $2, gpus = NULL, updated_at = now()
                     WHERE id = $1 AND state NOT IN ('closed', 'failed')",
                )
                .bind(session_id)
                .bind(session_update.state)
                .execute(&mut *tx)
                .await?;
            } else {
                // A cancel issued by the controller must not be overwritten
                // by a stale agent-side `active`.
                sqlx::query(
                    "UPDATE sessions SET state = $2, updated_at = now()
                     WHERE id = $1 AND state NOT IN ('closed', 'failed', 'canceling')",
                )
                .bind(session_id)
                .bind(session_update.state)
                .execute(&mut *tx)
                .await?;
            }

            for connection in &session_update.connections {
                sqlx::query(
                    "INSERT INTO connections (id, session_id, pid, process_name, exit_code)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (id) DO UPDATE SET exit_code = EXCLUDED.exit_code",
                )
                .bind(connection.id)
                .bind(session_id)
                .bind(connection.pid)
                .bind(&connection.process_name)
                .bind(connection.exit_code)
                .execute(&mut *tx)
                .await?;
            }
        }

        match update.state {
            Some(state) => {
                sqlx::query(
                    "UPDATE agents SET state = $1, gpus = $2, updated_at = now() WHERE id = $3",
                )
                .bind(state)
                .bind(Json(&gpus))
                .bind(update.id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("UPDATE agents SET gpus = $1, updated_at = now() WHERE id = $2")
                    .bind(Json(&gpus))
                    .bind(update.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flip active agents whose heartbeat is older than `threshold` to
    /// missing. Returns the number of rows flipped.
    pub async fn set_agents_missing_if_not_updated_for(
        &self,
        threshold: Duration,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET state = 'missing', updated_at = now()
             WHERE state = 'active' AND updated_at <= now() - make_interval(secs => $1)",
        )
        .bind(threshold.as_secs_f64())
        .execute(self.pool())
        .await?;
        if result.rows_affected() > 0 {
            debug!("{} agents flipped to missing", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Delete missing agents whose heartbeat is older than `threshold`.
    /// Their non-terminal sessions are failed in the same transaction, so a
    /// session never points at a vanished agent while still looking alive.
    pub async fn remove_missing_agents_if_not_updated_for(
        &self,
        threshold: Duration,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE sessions SET state = 'failed', gpus = NULL, updated_at = now()
             WHERE state NOT IN ('closed', 'failed')
               AND agent_id IN (
                   SELECT id FROM agents
                   WHERE state = 'missing' AND updated_at <= now() - make_interval(secs => $1)
               )",
        )
        .bind(threshold.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "DELETE FROM agents
             WHERE state = 'missing' AND updated_at <= now() - make_interval(secs => $1)",
        )
        .bind(threshold.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Lazy iterator over active agents, optionally scoped to a pool.
    pub fn get_agents(&self, pool_id: Option<Uuid>) -> AgentIterator {
        AgentIterator::new(
            self.clone(),
            AgentFilter { pool_id, ..AgentFilter::default() },
        )
    }

    /// Lazy iterator over active agents passing the scheduler's pre-filter:
    /// enough free VRAM overall, every required label present, and no taint
    /// outside the tolerated set.
    pub fn get_available_agents_matching(
        &self,
        vram_at_least: u64,
        pool_id: Option<Uuid>,
        required_labels: &BTreeMap<String, String>,
        tolerates: &BTreeMap<String, String>,
    ) -> AgentIterator {
        AgentIterator::new(
            self.clone(),
            AgentFilter {
                pool_id,
                vram_at_least: Some(vram_at_least as i64),
                required_labels: required_labels.clone(),
                tolerates: Some(tolerates.clone()),
            },
        )
    }
}
