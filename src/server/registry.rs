//! Live session registry
//!
//! Tracks every connected session for the administration channel: who is
//! connected, as whom, how securely, and a handle to disconnect them.

use crate::admin::types::{SecureState, SessionInfo, Timestamp};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::task::AbortHandle;

struct Slot {
    info: SessionInfo,
    abort: Option<AbortHandle>,
}

/// Registry of live sessions, shared between listeners and the
/// administration server
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Assign an id and record a new session
    pub fn register(&self, peer: SocketAddr, protocol_name: &str, secure: bool) -> SessionInfo {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = SessionInfo {
            id,
            start_time: Timestamp::now(),
            peer_host: peer.ip().to_string(),
            address_family: if peer.is_ipv4() { 4 } else { 6 },
            username: None,
            protocol_name: protocol_name.to_owned(),
            secure_state: if secure {
                SecureState::Secure
            } else {
                SecureState::Insecure
            },
        };
        self.lock().insert(
            id,
            Slot {
                info: info.clone(),
                abort: None,
            },
        );
        info
    }

    /// Attach the session task's abort handle so KickSession works
    pub fn attach_abort(&self, id: u64, abort: AbortHandle) {
        if let Some(slot) = self.lock().get_mut(&id) {
            slot.abort = Some(abort);
        }
    }

    /// Record the authenticated user
    pub fn set_username(&self, id: u64, username: &str) {
        if let Some(slot) = self.lock().get_mut(&id) {
            slot.info.username = Some(username.to_owned());
        }
    }

    /// Record a TLS state change
    pub fn set_secure_state(&self, id: u64, state: SecureState) {
        if let Some(slot) = self.lock().get_mut(&id) {
            slot.info.secure_state = state;
        }
    }

    /// Drop a finished session
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Abort one session's task; returns false when the id is unknown
    pub fn kick(&self, id: u64) -> bool {
        match self.lock().get(&id) {
            Some(slot) => {
                if let Some(abort) = &slot.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session is connected
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot for the administration channel
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.lock().values().map(|s| s.info.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Slot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
