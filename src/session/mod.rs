//! Sessions: server-side state for one connected peer.
//!
//! A `Session` is created by the connection that accepted the socket and shared
//! (`Arc`) with the registry, which reaches it by id for pushes, responses and
//! broadcasts. All mutable fields are atomics or short-held locks so handlers can
//! touch a session from the connection worker while the registry reads it.

mod registry;

pub use registry::{RegistrySnapshot, SessionInfo, SessionRegistry};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Role, SessionId};

/// Shared handle passed to handlers and held by the registry.
pub type SessionHandle = Arc<Session>;

/// Connection state machine: `Closed → Handshaking → Working`, `Closed` on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionStatus {
    Closed = 0,
    Handshaking = 1,
    Working = 2,
}

impl SessionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionStatus::Handshaking,
            2 => SessionStatus::Working,
            _ => SessionStatus::Closed,
        }
    }
}

/// The transport side of a session: where its frames go and how to close it.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub peer: SocketAddr,
    /// Encoded frames for the connection's writer task.
    pub outbound: mpsc::Sender<Bytes>,
    /// Cancelling this closes the socket and stops the connection's tasks.
    pub closer: CancellationToken,
}

impl SessionLink {
    /// Build a link plus the receiving end its writer drains.
    pub fn channel(peer: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let link = Self {
            peer,
            outbound,
            closer: CancellationToken::new(),
        };
        (link, rx)
    }
}

/// One logical client.
pub struct Session {
    id: SessionId,
    role: Role,
    peer: SocketAddr,
    created_at: DateTime<Utc>,
    status: AtomicU8,
    last_request_id: AtomicU64,
    heartbeat_timeout: Duration,
    deadline: Mutex<Instant>,
    outbound: mpsc::Sender<Bytes>,
    closer: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        link: SessionLink,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            id,
            role,
            peer: link.peer,
            created_at: Utc::now(),
            status: AtomicU8::new(SessionStatus::Closed as u8),
            last_request_id: AtomicU64::new(0),
            heartbeat_timeout,
            deadline: Mutex::new(Instant::now() + heartbeat_timeout),
            outbound: link.outbound,
            closer: link.closer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Id of the request currently being served; 0 after a notify.
    pub fn last_request_id(&self) -> u64 {
        self.last_request_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_request_id(&self, id: u64) {
        self.last_request_id.store(id, Ordering::Release);
    }

    /// Push the liveness deadline one timeout into the future.
    pub fn heartbeat(&self) {
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = Instant::now() + self.heartbeat_timeout;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Whether the connection behind this session has been told to close.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Queue an encoded frame for the socket writer without waiting.
    ///
    /// Returns `false` if the frame was not queued.
    pub(crate) fn write(&self, frame: Bytes) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "session {} ({}) outbound queue full, dropping frame",
                    self.id,
                    self.role
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Mark closed and stop the connection's tasks. Idempotent.
    pub(crate) fn close(&self) {
        self.set_status(SessionStatus::Closed);
        self.closer.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("status", &self.status())
            .field("last_request_id", &self.last_request_id())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} session {} peer={} status={:?}",
            self.role,
            self.id,
            self.peer,
            self.status()
        )
    }
}
