//! Session registry: every live frontend and backend session, by id.
//!
//! Frontend and backend bookkeeping are two independent tables, each with its
//! own id counter and lock. A session lives in the table of its role for its
//! whole life.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::packet::{self, PacketType};
use crate::protocol::{Message, Route};
use crate::session::{Session, SessionHandle, SessionLink, SessionStatus};
use crate::types::{Result, Role, SessionId};

#[derive(Debug)]
struct SessionTable {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, session: SessionHandle) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session);
    }

    fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn all(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Diagnostic view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub status: SessionStatus,
    pub last_request_id: u64,
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    fn of(session: &Session) -> Self {
        Self {
            id: session.id(),
            peer: session.peer(),
            status: session.status(),
            last_request_id: session.last_request_id(),
            created_at: session.created_at(),
        }
    }
}

/// Point-in-time view of the registry for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub role: Role,
    pub frontend_count: usize,
    pub backend_count: usize,
    pub frontend: Vec<SessionInfo>,
    pub backend: Vec<SessionInfo>,
}

/// Tracks live sessions under concurrent access from every connection.
#[derive(Debug)]
pub struct SessionRegistry {
    role: Role,
    heartbeat_timeout: Duration,
    frontend: SessionTable,
    backend: SessionTable,
}

impl SessionRegistry {
    /// `role` decides which table `create_session` and `broadcast` use.
    pub fn new(role: Role, heartbeat_timeout: Duration) -> Self {
        Self {
            role,
            heartbeat_timeout,
            frontend: SessionTable::new(),
            backend: SessionTable::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn table(&self, role: Role) -> &SessionTable {
        match role {
            Role::Frontend => &self.frontend,
            Role::Backend => &self.backend,
        }
    }

    /// Create a session in the table matching this node's role.
    pub fn create_session(&self, link: SessionLink) -> SessionHandle {
        self.create(self.role, link)
    }

    pub fn create_frontend_session(&self, link: SessionLink) -> SessionHandle {
        self.create(Role::Frontend, link)
    }

    pub fn create_backend_session(&self, link: SessionLink) -> SessionHandle {
        self.create(Role::Backend, link)
    }

    fn create(&self, role: Role, link: SessionLink) -> SessionHandle {
        let table = self.table(role);
        let id = table.allocate_id();
        let session = SessionHandle::new(Session::new(id, role, link, self.heartbeat_timeout));
        table.insert(session.clone());
        tracing::debug!("created {} session {} for {}", role, id, session.peer());
        session
    }

    pub fn get(&self, role: Role, id: SessionId) -> Option<SessionHandle> {
        self.table(role).get(id)
    }

    pub fn len(&self, role: Role) -> usize {
        self.table(role).len()
    }

    pub fn is_empty(&self) -> bool {
        self.frontend.len() == 0 && self.backend.len() == 0
    }

    /// Queue a raw frame for a session. A no-op returning `false` once the
    /// session has left the registry.
    pub fn send(&self, session: &Session, frame: Bytes) -> bool {
        match self.table(session.role()).get(session.id()) {
            Some(live) => live.write(frame),
            None => {
                tracing::trace!("send to closed {} session {} ignored", session.role(), session.id());
                false
            }
        }
    }

    /// Send a server push on `route`.
    pub fn push(&self, session: &Session, route: &str, body: impl Into<Bytes>) -> Result<bool> {
        let frame = push_frame(route, body.into())?;
        Ok(self.send(session, frame))
    }

    /// Answer the session's last request.
    ///
    /// After a notify the recorded id is 0 and the response still goes out
    /// keyed to 0; pairing responses with requests is the handler's job.
    pub fn response(&self, session: &Session, body: impl Into<Bytes>) -> Result<bool> {
        let message = Message::response(session.last_request_id(), body);
        let frame = packet::pack(PacketType::Data, &message.encode()?)?;
        Ok(self.send(session, frame))
    }

    /// Push to every session of this node's role. Returns how many frames
    /// were queued.
    pub fn broadcast(&self, route: &str, body: impl Into<Bytes>) -> Result<usize> {
        let frame = push_frame(route, body.into())?;
        let sessions = self.table(self.role).all();
        let delivered = sessions
            .iter()
            .filter(|session| session.write(frame.clone()))
            .count();
        tracing::debug!(
            "broadcast route={} to {}/{} {} sessions",
            route,
            delivered,
            sessions.len(),
            self.role
        );
        Ok(delivered)
    }

    /// Close the socket and forget the session. Safe to call repeatedly.
    pub fn close_session(&self, session: &Session) -> bool {
        let removed = self.table(session.role()).remove(session.id()).is_some();
        session.close();
        if removed {
            tracing::debug!("closed {} session {}", session.role(), session.id());
        }
        removed
    }

    /// Close every session of both roles. Returns how many were removed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for table in [&self.frontend, &self.backend] {
            for session in table.all() {
                if self.close_session(&session) {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Sessions whose liveness deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<SessionHandle> {
        self.frontend
            .all()
            .into_iter()
            .chain(self.backend.all())
            .filter(|session| session.is_expired(now))
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut frontend: Vec<SessionInfo> =
            self.frontend.all().iter().map(|s| SessionInfo::of(s)).collect();
        let mut backend: Vec<SessionInfo> =
            self.backend.all().iter().map(|s| SessionInfo::of(s)).collect();
        frontend.sort_by_key(|info| info.id);
        backend.sort_by_key(|info| info.id);
        RegistrySnapshot {
            role: self.role,
            frontend_count: frontend.len(),
            backend_count: backend.len(),
            frontend,
            backend,
        }
    }

    /// Log session counts and identities.
    pub fn dump_sessions(&self) {
        tracing::info!(
            "current sessions: frontend={}, backend={}",
            self.len(Role::Frontend),
            self.len(Role::Backend)
        );
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let snapshot = self.snapshot();
        for info in snapshot.frontend.iter().chain(snapshot.backend.iter()) {
            tracing::debug!(
                "session: id={} peer={} status={:?}",
                info.id,
                info.peer,
                info.status
            );
        }
    }
}

fn push_frame(route: &str, body: Bytes) -> Result<Bytes> {
    let message = Message::push(Route::Name(route.to_string()), body);
    packet::pack(PacketType::Data, &message.encode()?)
}
