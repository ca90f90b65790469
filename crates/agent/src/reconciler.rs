//! Agent↔controller reconciliation loop.
//!
//! Once per second: pull the controller's view of this agent's sessions,
//! start or cancel local sessions accordingly, fold the locally buffered
//! session/connection updates into one batch, snapshot GPU metrics, and
//! push a single agent update back. Both views converge within a tick even
//! when individual update events were dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::model::{
    AgentRegistration, AgentState, AgentUpdate, SessionState, SessionUpdate,
};
use fleet_core::{ControllerClient, Error};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::metrics;
use crate::registry::{ConnectionEvent, SessionEvent};
use crate::state::AgentRuntime;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Register with the controller, advertising identity, devices, labels, and
/// taints. Returns the id the controller assigned (or confirmed, when
/// rejoining).
pub async fn connect_to_controller(
    client: &ControllerClient,
    runtime: &AgentRuntime,
    rejoin_id: Option<Uuid>,
) -> Result<Uuid, Error> {
    let registration = AgentRegistration {
        id: rejoin_id,
        hostname: runtime.hostname.clone(),
        address: runtime.address.clone(),
        version: runtime.version.clone(),
        pool_id: runtime.pool_id,
        gpus: runtime.snapshot_gpus(),
        labels: runtime.labels.clone(),
        taints: runtime.taints.clone(),
    };

    let id = client.register_agent(&registration).await?;
    info!(agent_id = %id, controller = client.base_url(), "registered with controller");
    Ok(id)
}

/// Fold buffered per-session events into one update map: latest state wins,
/// connections accumulate by connection id. Connection events for sessions
/// without a state event fall back to `current_state`.
pub fn merge_updates(
    session_events: Vec<SessionEvent>,
    connection_events: Vec<ConnectionEvent>,
    current_state: impl Fn(Uuid) -> Option<SessionState>,
) -> HashMap<Uuid, SessionUpdate> {
    let mut updates: HashMap<Uuid, SessionUpdate> = HashMap::new();

    for event in session_events {
        updates
            .entry(event.id)
            .and_modify(|u| u.state = event.state)
            .or_insert(SessionUpdate { state: event.state, connections: vec![] });
    }

    for event in connection_events {
        let update = updates.entry(event.session_id).or_insert_with(|| SessionUpdate {
            state: current_state(event.session_id).unwrap_or(SessionState::Active),
            connections: vec![],
        });
        match update.connections.iter_mut().find(|c| c.id == event.connection.id) {
            Some(existing) => *existing = event.connection,
            None => update.connections.push(event.connection),
        }
    }

    updates
}

pub struct Reconciler {
    pub client: ControllerClient,
    pub agent_id: Uuid,
    pub runtime: Arc<AgentRuntime>,
    pub session_rx: mpsc::Receiver<SessionEvent>,
    pub connection_rx: mpsc::Receiver<ConnectionEvent>,
}

impl Reconciler {
    /// Run until cancellation or the first tick error. Either way a final
    /// best-effort `closed` update is pushed before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        info!(
            agent_id = %self.agent_id,
            "reconciler started (tick interval: {}s)",
            TICK_INTERVAL.as_secs()
        );

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.send_closed().await;
                    info!("reconciler stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "reconcile tick failed");
                        self.send_closed().await;
                        return Err(e);
                    }
                    metrics().reconcile_ticks.inc();
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), Error> {
        let view = self.client.get_agent(self.agent_id).await?;

        for session in view.sessions {
            match session.state {
                SessionState::Assigned => {
                    if self.runtime.registry.get(session.id).is_none() {
                        self.runtime.registry.register(session);
                    }
                }
                SessionState::Canceling => {
                    self.runtime.registry.cancel(session.id);
                }
                _ => {}
            }
        }

        let session_events = drain(&mut self.session_rx);
        let connection_events = drain(&mut self.connection_rx);
        let registry = self.runtime.registry.clone();
        let sessions = merge_updates(session_events, connection_events, |id| {
            registry.get(id).map(|s| s.state())
        });

        let update = AgentUpdate {
            id: self.agent_id,
            state: Some(AgentState::Active),
            gpus: self.runtime.snapshot_gpu_metrics(),
            sessions,
        };
        self.client.update_agent(&update).await
    }

    async fn send_closed(&self) {
        let update = AgentUpdate {
            id: self.agent_id,
            state: Some(AgentState::Closed),
            gpus: vec![],
            sessions: HashMap::new(),
        };
        if let Err(e) = self.client.update_agent(&update).await {
            warn!(error = %e, "final closed update failed");
        }
    }
}

fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::model::Connection;

    fn session_event(id: Uuid, state: SessionState) -> SessionEvent {
        SessionEvent { id, state }
    }

    fn connection_event(session_id: Uuid, connection_id: Uuid, exit_code: Option<i32>) -> ConnectionEvent {
        ConnectionEvent {
            session_id,
            connection: Connection {
                id: connection_id,
                pid: 7,
                process_name: "client".to_string(),
                exit_code,
            },
        }
    }

    #[test]
    fn test_merge_latest_state_wins() {
        let id = Uuid::new_v4();
        let updates = merge_updates(
            vec![
                session_event(id, SessionState::Active),
                session_event(id, SessionState::Closed),
            ],
            vec![],
            |_| None,
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[&id].state, SessionState::Closed);
    }

    #[test]
    fn test_merge_accumulates_connections_by_id() {
        let session_id = Uuid::new_v4();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let updates = merge_updates(
            vec![session_event(session_id, SessionState::Active)],
            vec![
                connection_event(session_id, conn_a, None),
                connection_event(session_id, conn_b, None),
                // Termination of A supersedes its attach record.
                connection_event(session_id, conn_a, Some(0)),
            ],
            |_| None,
        );
        let update = &updates[&session_id];
        assert_eq!(update.connections.len(), 2);
        let a = update.connections.iter().find(|c| c.id == conn_a).unwrap();
        assert_eq!(a.exit_code, Some(0));
    }

    #[test]
    fn test_merge_connection_without_state_event_uses_current_state() {
        let session_id = Uuid::new_v4();
        let updates = merge_updates(
            vec![],
            vec![connection_event(session_id, Uuid::new_v4(), None)],
            |_| Some(SessionState::Active),
        );
        assert_eq!(updates[&session_id].state, SessionState::Active);
    }

    #[test]
    fn test_merge_independent_sessions_stay_separate() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let updates = merge_updates(
            vec![
                session_event(a, SessionState::Active),
                session_event(b, SessionState::Closed),
            ],
            vec![],
            |_| None,
        );
        assert_eq!(updates[&a].state, SessionState::Active);
        assert_eq!(updates[&b].state, SessionState::Closed);
    }
}
