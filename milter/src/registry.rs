use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;

use crate::session::Session;

/// Opaque per-connection handle issued by the transport layer.
///
/// Only ever used as a lookup key into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        ConnId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Maps live connections to their sessions.
///
/// The map is guarded by a single reader/writer lock that is only ever held
/// for the map operation itself; session mutation happens behind the
/// per-session mutex, and slow work (persistence, policy) never runs under
/// either lock from more than one task.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnId, SharedSession>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a session with a fresh process-unique id and registers it
    /// under `conn`.
    pub fn create(&self, conn: ConnId) -> SharedSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Mutex::new(Session::new(id)));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn, Arc::clone(&session));
        session
    }

    /// Absence is a signal, not a failure: the MTA side is known to deliver
    /// callbacks for connections it never announced.
    pub fn lookup(&self, conn: ConnId) -> Option<SharedSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conn)
            .cloned()
    }

    /// Evicts an ended session. Retention is exactly the connection lifetime;
    /// anything the operator wants to keep longer goes through the sink.
    pub fn remove(&self, conn: ConnId) -> Option<SharedSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}
