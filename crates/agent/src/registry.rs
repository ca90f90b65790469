//! In-memory registry of the sessions this agent is running.
//!
//! Lookups hand out `Arc` handles; a session object is dropped once it has
//! reached a terminal state, left the map, and the last handle is released.
//! State and connection changes are emitted onto two bounded channels that
//! the reconciler drains once per tick; emission never blocks, and a full
//! channel drops the update (the next full controller comparison
//! re-converges the view).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::model::{
    Connection, ConnectionData, Session, SessionGpu, SessionState,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::metrics;

/// Bounded depth of both update channels.
pub const UPDATE_CHANNEL_DEPTH: usize = 32;

/// How long a canceled session may wait for its connections to drain
/// before it is torn down anyway.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

pub trait ConnectionIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnectionIo for T {}

/// Raw bidirectional stream handed over by the connect endpoint.
pub type BoxedIo = Box<dyn ConnectionIo>;

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub id: Uuid,
    pub state: SessionState,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub session_id: Uuid,
    pub connection: Connection,
}

/// A session running on this agent.
pub struct LocalSession {
    pub id: Uuid,
    pub version: String,
    pub pool_id: Option<Uuid>,
    pub gpus: Vec<SessionGpu>,
    state: Mutex<SessionState>,
    connections: Mutex<Vec<Connection>>,
    cancel: CancellationToken,
    /// Signaled whenever a connection terminates.
    connection_done: Notify,
}

impl LocalSession {
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock") = state;
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().expect("session connections lock").clone()
    }

    fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .expect("session connections lock")
            .iter()
            .filter(|c| c.exit_code.is_none())
            .count()
    }

    /// Controller-facing view of this session.
    pub fn to_session(&self, address: Option<String>) -> Session {
        Session {
            id: self.id,
            state: self.state(),
            address,
            version: self.version.clone(),
            pool_id: self.pool_id,
            agent_id: None,
            gpus: self.gpus.clone(),
            connections: self.connections(),
            updated_at: None,
        }
    }
}

struct RegistryInner {
    sessions: Mutex<HashMap<Uuid, Arc<LocalSession>>>,
    session_tx: mpsc::Sender<SessionEvent>,
    connection_tx: mpsc::Sender<ConnectionEvent>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        session_tx: mpsc::Sender<SessionEvent>,
        connection_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                session_tx,
                connection_tx,
            }),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<LocalSession>> {
        self.inner.sessions.lock().expect("registry lock").get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().expect("registry lock").len()
    }

    /// VRAM currently reserved per device index across live sessions.
    pub fn reservations(&self) -> HashMap<u32, u64> {
        let mut out: HashMap<u32, u64> = HashMap::new();
        for session in self.inner.sessions.lock().expect("registry lock").values() {
            if session.state().is_terminal() {
                continue;
            }
            for gpu in &session.gpus {
                *out.entry(gpu.index).or_default() += gpu.vram_reserved;
            }
        }
        out
    }

    /// Start a session from its controller (or local) description and emit
    /// the `active` transition. The teardown watcher runs until the session's
    /// cancel signal fires.
    pub fn register(&self, session: Session) -> Arc<LocalSession> {
        let local = Arc::new(LocalSession {
            id: session.id,
            version: session.version,
            pool_id: session.pool_id,
            gpus: session.gpus,
            state: Mutex::new(SessionState::Active),
            connections: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            connection_done: Notify::new(),
        });

        self.inner
            .sessions
            .lock()
            .expect("registry lock")
            .insert(local.id, local.clone());

        metrics().sessions_started.inc();
        metrics().sessions_active.set(self.len() as i64);
        info!(session_id = %local.id, gpus = local.gpus.len(), "session started");
        self.emit_session(SessionEvent { id: local.id, state: SessionState::Active });

        let registry = self.clone();
        let watched = local.clone();
        tokio::spawn(async move {
            registry.watch_teardown(watched).await;
        });

        local
    }

    /// Trigger a session's cancel signal. Idempotent; unknown ids are a
    /// no-op since the next reconcile pass would not find them either.
    pub fn cancel(&self, id: Uuid) {
        if let Some(session) = self.get(id) {
            if !session.cancel.is_cancelled() {
                info!(session_id = %id, "canceling session");
                session.cancel.cancel();
            }
        }
    }

    /// Hand a hijacked client connection to a running session. The stream is
    /// watched until it closes, at which point the connection's exit code is
    /// recorded and re-emitted.
    pub fn attach_connection(
        &self,
        session_id: Uuid,
        data: ConnectionData,
        io: BoxedIo,
    ) -> Result<Connection, fleet_core::Error> {
        let session = self
            .get(session_id)
            .ok_or_else(|| fleet_core::Error::NotFound(format!("session {}", session_id)))?;
        if session.state().is_terminal() {
            return Err(fleet_core::Error::Other(format!(
                "session {} is already {}",
                session_id,
                session.state()
            )));
        }

        let connection = Connection {
            id: Uuid::new_v4(),
            pid: data.pid,
            process_name: data.process_name,
            exit_code: None,
        };
        session
            .connections
            .lock()
            .expect("session connections lock")
            .push(connection.clone());

        metrics().connections_active.inc();
        debug!(
            session_id = %session_id,
            connection_id = %connection.id,
            pid = connection.pid,
            "connection attached"
        );
        self.emit_connection(ConnectionEvent {
            session_id,
            connection: connection.clone(),
        });

        let registry = self.clone();
        let connection_id = connection.id;
        tokio::spawn(async move {
            registry.watch_connection(session, connection_id, io).await;
        });

        Ok(connection)
    }

    /// Drive a connection's stream to EOF (or session cancellation), then
    /// record its exit code.
    async fn watch_connection(&self, session: Arc<LocalSession>, id: Uuid, mut io: BoxedIo) {
        let mut sink = tokio::io::sink();
        let exit_code = tokio::select! {
            result = tokio::io::copy(&mut io, &mut sink) => {
                match result {
                    Ok(_) => 0,
                    Err(_) => 1,
                }
            }
            _ = session.cancel.cancelled() => 0,
        };

        {
            let mut connections = session.connections.lock().expect("session connections lock");
            if let Some(connection) = connections.iter_mut().find(|c| c.id == id) {
                connection.exit_code = Some(exit_code);
                self.emit_connection(ConnectionEvent {
                    session_id: session.id,
                    connection: connection.clone(),
                });
            }
        }

        metrics().connections_active.dec();
        session.connection_done.notify_waiters();
        debug!(session_id = %session.id, connection_id = %id, exit_code, "connection closed");
    }

    /// Wait for the cancel signal, give open connections a grace period to
    /// drain, then mark the session closed, emit the transition, and drop it
    /// from the map.
    async fn watch_teardown(&self, session: Arc<LocalSession>) {
        session.cancel.cancelled().await;

        let drained = tokio::time::timeout(CANCEL_GRACE, async {
            loop {
                // Register for the wakeup before checking, so a connection
                // finishing in between cannot be missed.
                let notified = session.connection_done.notified();
                if session.open_connections() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                session_id = %session.id,
                open = session.open_connections(),
                "grace period elapsed with connections still open"
            );
        }

        session.set_state(SessionState::Closed);
        self.emit_session(SessionEvent { id: session.id, state: SessionState::Closed });

        self.inner.sessions.lock().expect("registry lock").remove(&session.id);
        metrics().sessions_active.set(self.len() as i64);
        info!(session_id = %session.id, "session closed");
    }

    fn emit_session(&self, event: SessionEvent) {
        if self.inner.session_tx.try_send(event).is_err() {
            warn!("dropping session update; the next reconcile pass re-converges");
        }
    }

    fn emit_connection(&self, event: ConnectionEvent) {
        if self.inner.connection_tx.try_send(event).is_err() {
            warn!("dropping connection update; the next reconcile pass re-converges");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    fn session(vram: u64) -> Session {
        Session {
            id: Uuid::new_v4(),
            state: SessionState::Assigned,
            address: None,
            version: "1".to_string(),
            pool_id: None,
            agent_id: None,
            gpus: vec![SessionGpu { index: 0, vram_reserved: vram }],
            connections: vec![],
            updated_at: None,
        }
    }

    fn registry() -> (SessionRegistry, mpsc::Receiver<SessionEvent>, mpsc::Receiver<ConnectionEvent>) {
        let (session_tx, session_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
        let (connection_tx, connection_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
        (SessionRegistry::new(session_tx, connection_tx), session_rx, connection_rx)
    }

    #[tokio::test]
    async fn test_register_emits_active_then_cancel_emits_closed() {
        let (registry, mut session_rx, _connection_rx) = registry();
        let local = registry.register(session(8 * GB));
        let id = local.id;

        let event = session_rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.state, SessionState::Active);

        registry.cancel(id);
        let event = session_rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.state, SessionState::Closed);

        // Terminal sessions leave the map; the held handle stays valid.
        assert!(registry.get(id).is_none());
        assert_eq!(local.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session_is_noop() {
        let (registry, _session_rx, _connection_rx) = registry();
        registry.cancel(Uuid::new_v4());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_reservations_sum_live_sessions_per_device() {
        let (registry, _session_rx, _connection_rx) = registry();
        registry.register(session(8 * GB));
        registry.register(session(2 * GB));

        let reservations = registry.reservations();
        assert_eq!(reservations[&0], 10 * GB);
    }

    #[tokio::test]
    async fn test_attach_connection_records_and_reports_exit() {
        let (registry, _session_rx, mut connection_rx) = registry();
        let local = registry.register(session(GB));

        let (client, server) = tokio::io::duplex(64);
        let connection = registry
            .attach_connection(
                local.id,
                ConnectionData { pid: 4242, process_name: "renderer".to_string() },
                Box::new(server),
            )
            .unwrap();

        let attached = connection_rx.recv().await.unwrap();
        assert_eq!(attached.connection.id, connection.id);
        assert_eq!(attached.connection.pid, 4242);
        assert!(attached.connection.exit_code.is_none());

        // Closing the client half drives the stream to EOF.
        drop(client);
        let finished = connection_rx.recv().await.unwrap();
        assert_eq!(finished.connection.id, connection.id);
        assert_eq!(finished.connection.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_attach_connection_to_unknown_session_fails() {
        let (registry, _session_rx, _connection_rx) = registry();
        let (_client, server) = tokio::io::duplex(64);
        let result = registry.attach_connection(
            Uuid::new_v4(),
            ConnectionData { pid: 1, process_name: "x".to_string() },
            Box::new(server),
        );
        assert!(result.is_err());
    }
}
