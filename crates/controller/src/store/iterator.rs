//! Lazily paginated, forward-only iterators over store rows.
//!
//! Each iterator pulls one page at a time (`PAGE_SIZE` rows, `created_at`
//! ascending) and hands rows out one by one; callers drain with
//! `while let Some(x) = it.next().await?`. Not thread-safe and single-pass,
//! like the cursors they wrap.

use std::collections::{BTreeMap, VecDeque};

use fleet_core::model::{Agent, QueuedSession, SessionRequirements};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use super::agents::AgentRow;
use super::error::StoreError;
use super::{Store, PAGE_SIZE};

/// Filter applied by [`AgentIterator`]; everything is ANDed together on top
/// of `state = 'active'`. `tolerates: None` lists tainted agents too;
/// `Some(map)` keeps only agents whose every taint appears in the map.
#[derive(Default, Clone)]
pub(crate) struct AgentFilter {
    pub pool_id: Option<Uuid>,
    pub vram_at_least: Option<i64>,
    pub required_labels: BTreeMap<String, String>,
    pub tolerates: Option<BTreeMap<String, String>>,
}

impl AgentFilter {
    fn push_page_query<'a>(&'a self, offset: i64) -> QueryBuilder<'a, Postgres> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, state, hostname, address, version, pool_id, gpus, \
             vram_available, updated_at FROM agents WHERE state = 'active'",
        );

        if let Some(pool_id) = self.pool_id {
            qb.push(" AND pool_id = ").push_bind(pool_id);
        }

        if let Some(vram) = self.vram_at_least {
            qb.push(" AND vram_available >= ").push_bind(vram);
        }

        for (key, value) in &self.required_labels {
            qb.push(
                " AND EXISTS (SELECT 1 FROM agent_labels al \
                 JOIN key_values kv ON kv.id = al.key_value_id \
                 WHERE al.agent_id = agents.id AND kv.key = ",
            )
            .push_bind(key)
            .push(" AND kv.value = ")
            .push_bind(value)
            .push(")");
        }

        // Every taint on the agent must appear in the tolerated set.
        if let Some(tolerates) = &self.tolerates {
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM agent_taints tnt \
                 JOIN key_values kv ON kv.id = tnt.key_value_id \
                 WHERE tnt.agent_id = agents.id",
            );
            let mut first = true;
            for (key, value) in tolerates {
                if first {
                    qb.push(" AND (kv.key, kv.value) NOT IN (");
                    first = false;
                } else {
                    qb.push(", ");
                }
                qb.push("(").push_bind(key).push(", ").push_bind(value).push(")");
            }
            if !first {
                qb.push(")");
            }
            qb.push(")");
        }

        qb.push(" ORDER BY created_at ASC OFFSET ")
            .push_bind(offset)
            .push(" LIMIT ")
            .push_bind(PAGE_SIZE);
        qb
    }
}

pub struct AgentIterator {
    store: Store,
    filter: AgentFilter,
    offset: i64,
    buffer: VecDeque<Agent>,
    exhausted: bool,
}

impl AgentIterator {
    pub(crate) fn new(store: Store, filter: AgentFilter) -> Self {
        Self { store, filter, offset: 0, buffer: VecDeque::new(), exhausted: false }
    }

    pub async fn next(&mut self) -> Result<Option<Agent>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let rows: Vec<AgentRow> = {
            let mut qb = self.filter.push_page_query(self.offset);
            qb.build_query_as().fetch_all(self.store.pool()).await?
        };

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        self.offset += rows.len() as i64;
        for row in rows {
            self.buffer.push_back(self.store.hydrate_agent(row).await?);
        }
        Ok(())
    }
}

pub struct QueuedSessionIterator {
    store: Store,
    offset: i64,
    buffer: VecDeque<QueuedSession>,
    exhausted: bool,
}

impl QueuedSessionIterator {
    pub(crate) fn new(store: Store) -> Self {
        Self { store, offset: 0, buffer: VecDeque::new(), exhausted: false }
    }

    pub async fn next(&mut self) -> Result<Option<QueuedSession>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let rows: Vec<(Uuid, Json<SessionRequirements>)> = sqlx::query_as(
            "SELECT id, requirements FROM sessions WHERE state = 'queued'
             ORDER BY created_at ASC OFFSET $1 LIMIT $2",
        )
        .bind(self.offset)
        .bind(PAGE_SIZE)
        .fetch_all(self.store.pool())
        .await?;

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        self.offset += rows.len() as i64;
        for (id, requirements) in rows {
            self.buffer.push_back(QueuedSession { id, requirements: requirements.0 });
        }
        Ok(())
    }
}
