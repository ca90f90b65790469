//! Wire and storage data model shared by the controller and the agent.
//!
//! Everything here crosses the HTTP boundary as JSON; the two lifecycle
//! enums additionally map onto the Postgres enum types of the same name.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Lifecycle states ─────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "agent_state", rename_all = "lowercase")]
pub enum AgentState {
    Active,
    Missing,
    Closed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Missing => write!(f, "missing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "session_state", rename_all = "lowercase")]
pub enum SessionState {
    Queued,
    Assigned,
    Active,
    Canceling,
    Closed,
    Failed,
}

impl SessionState {
    /// Closed and failed sessions never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::Active => write!(f, "active"),
            Self::Canceling => write!(f, "canceling"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ── GPUs ─────────────────────────────────────────────────────────────

/// Live utilization block, owned by the agent's sampler and copied on
/// transfer. All byte quantities are bytes; power draw is milliwatts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub utilization_gpu: u32,
    pub vram_used: u64,
    pub power_draw_mw: u64,
    pub temperature_c: u32,
}

/// A single device as advertised by an agent. Identity within an agent is
/// positional (index into the agent's GPU list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gpu {
    pub name: String,
    pub vendor: String,
    pub pci_bus: String,
    pub driver_version: String,
    /// Total VRAM in bytes.
    pub vram: u64,
    /// Feature tags the device advertises (matched against
    /// [`GpuRequirement::tags`]).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metrics: GpuMetrics,
}

/// Total installed VRAM across a device list.
pub fn total_vram(gpus: &[Gpu]) -> u64 {
    gpus.iter().map(|g| g.vram).sum()
}

/// One device a session asks for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuRequirement {
    /// Minimum free VRAM in bytes.
    pub vram_at_least: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A committed reservation on one device of the assigned agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGpu {
    pub index: u32,
    pub vram_reserved: u64,
}

// ── Sessions ─────────────────────────────────────────────────────────

/// The client's declarative statement of what a session needs.
/// Immutable once submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRequirements {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
    pub gpus: Vec<GpuRequirement>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tolerates: BTreeMap<String, String>,
}

impl SessionRequirements {
    /// Lower bound used by the scheduler's SQL pre-filter.
    pub fn vram_required(&self) -> u64 {
        self.gpus.iter().map(|g| g.vram_at_least).sum()
    }
}

/// A client process attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub pid: i64,
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Body of the connect call; the connection id is minted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionData {
    pub pid: i64,
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<SessionGpu>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    /// Set by the store; agents reporting their local view leave it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A session still waiting for placement: id plus the requirements blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSession {
    pub id: Uuid,
    pub requirements: SessionRequirements,
}

// ── Agents ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub state: AgentState,
    pub hostname: String,
    /// Network address as advertised to clients.
    pub address: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
    pub gpus: Vec<Gpu>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taints: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<Session>,
    pub vram_available: u64,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload pushed by an agent on startup. `id` is present
/// when an agent rejoins under an identity it was previously assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub hostname: String,
    pub address: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
    pub gpus: Vec<Gpu>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taints: BTreeMap<String, String>,
}

/// Per-session delta carried by an [`AgentUpdate`]. Connections are
/// accumulated by id; the state is the latest the agent observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
}

/// One reconciler tick's worth of agent-side changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
    /// Metrics for each device, positionally matching the stored GPU list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuMetrics>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sessions: HashMap<Uuid, SessionUpdate>,
}

// ── Pools & permissions ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "permission_kind", rename_all = "lowercase")]
pub enum Permission {
    Read,
    Manage,
    Admin,
}

/// A pool as seen from a user's permission listing, with live counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: Uuid,
    pub name: String,
    pub session_count: i64,
    pub agent_count: i64,
    pub user_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPermissions {
    pub permissions: HashMap<Permission, Vec<PoolInfo>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolPermissions {
    pub user_ids: HashMap<String, Vec<Permission>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub user_id: String,
    pub permission: Permission,
}

// ── Status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: String,
    pub version: String,
    pub hostname: String,
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&AgentState::Missing).unwrap(), "\"missing\"");
        assert_eq!(serde_json::to_string(&SessionState::Canceling).unwrap(), "\"canceling\"");
        assert_eq!(serde_json::to_string(&Permission::Manage).unwrap(), "\"manage\"");
    }

    #[test]
    fn test_states_deserialize_lowercase() {
        let s: SessionState = serde_json::from_str("\"assigned\"").unwrap();
        assert_eq!(s, SessionState::Assigned);
        let a: AgentState = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(a, AgentState::Active);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Queued.is_terminal());
        assert!(!SessionState::Canceling.is_terminal());
    }

    #[test]
    fn test_vram_required_sums_all_gpus() {
        let req = SessionRequirements {
            version: "1".to_string(),
            gpus: vec![
                GpuRequirement { vram_at_least: 8 << 30, ..Default::default() },
                GpuRequirement { vram_at_least: 4 << 30, ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(req.vram_required(), 12 << 30);
    }

    #[test]
    fn test_agent_update_round_trip() {
        let id = Uuid::new_v4();
        let mut sessions = HashMap::new();
        sessions.insert(
            Uuid::new_v4(),
            SessionUpdate { state: SessionState::Active, connections: vec![] },
        );
        let update = AgentUpdate {
            id,
            state: Some(AgentState::Active),
            gpus: vec![GpuMetrics { vram_used: 42, ..Default::default() }],
            sessions,
        };
        let json = serde_json::to_string(&update).unwrap();
        let back: AgentUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.gpus[0].vram_used, 42);
        assert_eq!(back.sessions.len(), 1);
    }
}
