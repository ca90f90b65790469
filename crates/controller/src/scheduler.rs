//! Placement loop: drains queued sessions in FIFO order and commits each to
//! the first eligible agent, plus the liveness sweeps that age out agents
//! whose heartbeats stopped.

use std::time::Duration;

use fleet_core::gpu::{GpuSet, SelectedGpuSet};
use fleet_core::model::{Agent, AgentState, SessionRequirements};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{Store, StoreError};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Active agents with heartbeats older than this are flipped to missing.
const MISSING_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Missing agents with heartbeats older than this are evicted; their
/// non-terminal sessions fail.
const EVICT_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Decide whether `agent` can host a session with `requirements`, and on
/// which devices. Pure: for a fixed snapshot the selection is unique.
pub fn agent_matches(
    agent: &Agent,
    requirements: &SessionRequirements,
) -> Option<SelectedGpuSet> {
    if agent.state != AgentState::Active {
        return None;
    }
    if let Some(pool_id) = requirements.pool_id {
        if agent.pool_id != Some(pool_id) {
            return None;
        }
    }
    for (key, value) in &requirements.match_labels {
        if agent.labels.get(key) != Some(value) {
            return None;
        }
    }
    for (key, value) in &agent.taints {
        if requirements.tolerates.get(key) != Some(value) {
            return None;
        }
    }

    // Deduct what the agent's live sessions already hold before searching.
    let mut gpu_set = GpuSet::new(agent.gpus.clone());
    for session in &agent.sessions {
        if !session.state.is_terminal() && gpu_set.select(&session.gpus).is_err() {
            warn!(
                agent_id = %agent.id,
                session_id = %session.id,
                "agent reports more reserved VRAM than its devices hold"
            );
            return None;
        }
    }

    gpu_set.find(&requirements.gpus)
}

/// One scheduler pass. Errors from individual sessions or agents are
/// accumulated so one bad row never blocks the rest of the queue.
pub async fn tick(store: &Store, cancel: &CancellationToken) -> Vec<StoreError> {
    let mut errors = Vec::new();

    if let Err(e) = store.set_agents_missing_if_not_updated_for(MISSING_THRESHOLD).await {
        errors.push(e);
    }
    if let Err(e) = store.remove_missing_agents_if_not_updated_for(EVICT_THRESHOLD).await {
        errors.push(e);
    }

    let mut queued = store.get_queued_sessions();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let session = match queued.next().await {
            Ok(Some(session)) => session,
            Ok(None) => break,
            Err(e) => {
                errors.push(e);
                break;
            }
        };

        let mut agents = store.get_available_agents_matching(
            session.requirements.vram_required(),
            session.requirements.pool_id,
            &session.requirements.match_labels,
            &session.requirements.tolerates,
        );

        loop {
            let agent = match agents.next().await {
                Ok(Some(agent)) => agent,
                Ok(None) => break,
                Err(e) => {
                    errors.push(e);
                    break;
                }
            };

            let Some(selection) = agent_matches(&agent, &session.requirements) else {
                continue;
            };

            debug!(
                session_id = %session.id,
                agent_id = %agent.id,
                gpus = selection.gpus().len(),
                "assigning session"
            );
            match store.assign_session(session.id, agent.id, selection.gpus()).await {
                Ok(()) => {}
                Err(e) => errors.push(e),
            }
            break;
        }
    }

    errors
}

/// Run the scheduler until cancellation: once immediately, then on a fixed
/// tick. An in-progress pass finishes its current commit before returning.
pub async fn run(store: Store, cancel: CancellationToken) {
    info!("scheduler started (tick interval: {}s)", TICK_INTERVAL.as_secs());

    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler stopped");
                return;
            }
            _ = interval.tick() => {
                let errors = tick(&store, &cancel).await;
                for error in &errors {
                    warn!(error = %error, "scheduler tick");
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::model::{
        Gpu, GpuRequirement, Session, SessionGpu, SessionState,
    };
    use std::collections::BTreeMap;
    use uuid::Uuid;

    const GB: u64 = 1 << 30;

    fn gpu(vram: u64) -> Gpu {
        Gpu {
            name: "L4".to_string(),
            vendor: "TestVendor".to_string(),
            pci_bus: String::new(),
            driver_version: String::new(),
            vram,
            tags: vec![],
            metrics: Default::default(),
        }
    }

    fn agent(gpus: Vec<Gpu>, labels: &[(&str, &str)], taints: &[(&str, &str)]) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            state: AgentState::Active,
            hostname: "host".to_string(),
            address: "10.0.0.1:43210".to_string(),
            version: "0.3.0".to_string(),
            pool_id: None,
            vram_available: gpus.iter().map(|g| g.vram).sum(),
            gpus,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            taints: taints.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            sessions: vec![],
            updated_at: Utc::now(),
        }
    }

    fn requirements(vram: u64, labels: &[(&str, &str)]) -> SessionRequirements {
        SessionRequirements {
            version: "1".to_string(),
            pool_id: None,
            gpus: vec![GpuRequirement { vram_at_least: vram, ..Default::default() }],
            match_labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            tolerates: BTreeMap::new(),
        }
    }

    fn running_session(agent_id: Uuid, gpus: Vec<SessionGpu>) -> Session {
        Session {
            id: Uuid::new_v4(),
            state: SessionState::Active,
            address: None,
            version: "1".to_string(),
            pool_id: None,
            agent_id: Some(agent_id),
            gpus,
            connections: vec![],
            updated_at: None,
        }
    }

    #[test]
    fn test_simple_assignment() {
        let agent = agent(vec![gpu(24 * GB)], &[("zone", "a")], &[]);
        let selection =
            agent_matches(&agent, &requirements(8 * GB, &[("zone", "a")])).unwrap();
        assert_eq!(selection.gpus(), &[SessionGpu { index: 0, vram_reserved: 8 * GB }]);
    }

    #[test]
    fn test_label_mismatch_never_matches() {
        let agent = agent(vec![gpu(24 * GB)], &[("zone", "a")], &[]);
        assert!(agent_matches(&agent, &requirements(8 * GB, &[("zone", "b")])).is_none());
    }

    #[test]
    fn test_missing_label_never_matches() {
        let agent = agent(vec![gpu(24 * GB)], &[], &[]);
        assert!(agent_matches(&agent, &requirements(8 * GB, &[("zone", "a")])).is_none());
    }

    #[test]
    fn test_untolerated_taint_rejects() {
        let agent = agent(vec![gpu(24 * GB)], &[], &[("maintenance", "true")]);
        assert!(agent_matches(&agent, &requirements(8 * GB, &[])).is_none());

        let mut req = requirements(8 * GB, &[]);
        req.tolerates.insert("maintenance".to_string(), "true".to_string());
        assert!(agent_matches(&agent, &req).is_some());
    }

    #[test]
    fn test_tolerating_a_different_value_rejects() {
        let agent = agent(vec![gpu(24 * GB)], &[], &[("maintenance", "true")]);
        let mut req = requirements(8 * GB, &[]);
        req.tolerates.insert("maintenance".to_string(), "false".to_string());
        assert!(agent_matches(&agent, &req).is_none());
    }

    #[test]
    fn test_non_active_agent_rejects() {
        let mut agent = agent(vec![gpu(24 * GB)], &[], &[]);
        agent.state = AgentState::Missing;
        assert!(agent_matches(&agent, &requirements(8 * GB, &[])).is_none());
    }

    #[test]
    fn test_pool_scoping() {
        let pool = Uuid::new_v4();
        let mut agent = agent(vec![gpu(24 * GB)], &[], &[]);
        let mut req = requirements(8 * GB, &[]);
        req.pool_id = Some(pool);
        assert!(agent_matches(&agent, &req).is_none());

        agent.pool_id = Some(pool);
        assert!(agent_matches(&agent, &req).is_some());

        // A session without a pool is indifferent to the agent's pool.
        assert!(agent_matches(&agent, &requirements(8 * GB, &[])).is_some());
    }

    #[test]
    fn test_existing_sessions_consume_capacity() {
        let mut a = agent(vec![gpu(10 * GB)], &[], &[]);
        a.sessions = vec![running_session(
            a.id,
            vec![SessionGpu { index: 0, vram_reserved: 8 * GB }],
        )];

        // 2 GB still fits, 4 GB does not.
        assert!(agent_matches(&a, &requirements(2 * GB, &[])).is_some());
        assert!(agent_matches(&a, &requirements(4 * GB, &[])).is_none());
    }

    #[test]
    fn test_terminal_sessions_do_not_consume_capacity() {
        let mut a = agent(vec![gpu(10 * GB)], &[], &[]);
        let mut done = running_session(a.id, vec![SessionGpu { index: 0, vram_reserved: 8 * GB }]);
        done.state = SessionState::Closed;
        a.sessions = vec![done];

        assert!(agent_matches(&a, &requirements(8 * GB, &[])).is_some());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let a = agent(vec![gpu(24 * GB), gpu(24 * GB)], &[], &[]);
        let req = requirements(8 * GB, &[]);
        let first = agent_matches(&a, &req).unwrap();
        let second = agent_matches(&a, &req).unwrap();
        assert_eq!(first.gpus(), second.gpus());
    }
}
