//! Persistent, transactional repository of agents, sessions, connections,
//! labels/taints, pools, and permissions.
//!
//! Method implementations are split by entity: `agents.rs`, `sessions.rs`,
//! `pools.rs`, `aggregate.rs`. All multi-row work runs inside a single
//! transaction; listing operations hand out lazily paginated iterators
//! (`iterator.rs`) rather than materializing whole tables.

mod agents;
mod aggregate;
mod error;
mod iterator;
mod pools;
mod sessions;

pub use aggregate::{AggregatedData, Percentiles};
pub use error::StoreError;
pub use iterator::{AgentIterator, QueuedSessionIterator};

use std::collections::BTreeMap;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Iterators fetch rows in batches of this size; callers never observe the
/// page boundary.
pub(crate) const PAGE_SIZE: i64 = 20;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// The four cross-reference tables sharing the deduplicated `key_values`
/// vocabulary.
#[derive(Clone, Copy)]
pub(crate) enum CrossRefTable {
    AgentLabels,
    AgentTaints,
    SessionMatchLabels,
    SessionTolerates,
}

impl CrossRefTable {
    fn insert_sql(self) -> &'static str {
        match self {
            Self::AgentLabels => {
                "INSERT INTO agent_labels (agent_id, key_value_id)
                 VALUES ($1, (SELECT id FROM key_values WHERE key = $2 AND value = $3))
                 ON CONFLICT DO NOTHING"
            }
            Self::AgentTaints => {
                "INSERT INTO agent_taints (agent_id, key_value_id)
                 VALUES ($1, (SELECT id FROM key_values WHERE key = $2 AND value = $3))
                 ON CONFLICT DO NOTHING"
            }
            Self::SessionMatchLabels => {
                "INSERT INTO session_match_labels (session_id, key_value_id)
                 VALUES ($1, (SELECT id FROM key_values WHERE key = $2 AND value = $3))
                 ON CONFLICT DO NOTHING"
            }
            Self::SessionTolerates => {
                "INSERT INTO session_tolerates (session_id, key_value_id)
                 VALUES ($1, (SELECT id FROM key_values WHERE key = $2 AND value = $3))
                 ON CONFLICT DO NOTHING"
            }
        }
    }
}

/// Intern each (key, value) pair into the vocabulary and link it to the
/// owning row. Runs inside the caller's transaction.
pub(crate) async fn link_key_values(
    tx: &mut Transaction<'_, Postgres>,
    table: CrossRefTable,
    owner_id: Uuid,
    entries: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    for (key, value) in entries {
        sqlx::query(
            "INSERT INTO key_values (key, value) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await?;

        sqlx::query(table.insert_sql())
            .bind(owner_id)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}
