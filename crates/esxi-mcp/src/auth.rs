//! API-key gate.
//!
//! With no key configured every session is open. Otherwise a session must
//! present the key, either through the `authenticate` tool (stdio) or a
//! request header (HTTP), before any other tool runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Default)]
pub struct ApiKeyGate {
    key: Option<String>,
}

impl std::fmt::Debug for ApiKeyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyGate").field("enabled", &self.key.is_some()).finish()
    }
}

impl ApiKeyGate {
    pub fn new(key: Option<String>) -> Self {
        Self { key: key.filter(|k| !k.is_empty()) }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Compares in time independent of where the first mismatch is.
    pub fn verify(&self, presented: &str) -> bool {
        match &self.key {
            None => true,
            Some(key) => {
                let (a, b) = (key.as_bytes(), presented.as_bytes());
                a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
            }
        }
    }

    /// A session for this gate, already authenticated when the gate is open.
    pub fn session(&self) -> Session {
        Session::new(!self.is_enabled())
    }

    /// Session for one HTTP request carrying `presented` (if any).
    pub fn session_for(&self, presented: Option<&str>) -> Session {
        Session::new(!self.is_enabled() || presented.is_some_and(|k| self.verify(k)))
    }
}

/// Per-connection state: a process-unique id that scopes request ids, and
/// the authentication flag.
#[derive(Debug)]
pub struct Session {
    id: u64,
    authenticated: AtomicBool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Session {
    pub fn new(authenticated: bool) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }
}
