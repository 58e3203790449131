// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Identity and Registry
//!
//! Every accepted client connection gets a random session id, minted once
//! before any backend connection is attempted. The registry tracks open
//! sessions for bookkeeping only; sessions never coordinate through it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use uuid::Uuid;

/// Opaque, immutable identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Mints a fresh random id.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// Bookkeeping record for an open session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Remote address of the client connection.
    pub peer: SocketAddr,
    /// When the client connection was accepted.
    pub connected_at: Instant,
}

/// Registry of open sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session; the entry is removed when the guard drops.
    pub fn register(&self, id: SessionId, peer: SocketAddr) -> Registration {
        let info = SessionInfo {
            peer,
            connected_at: Instant::now(),
        };
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(id, info);
        }
        Registration {
            registry: self.clone(),
            id,
        }
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Returns true if no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the session is currently open.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions
            .read()
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    /// Ids of all open sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the bookkeeping record of a session.
    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().ok()?.get(id).cloned()
    }

    fn remove(&self, id: &SessionId) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(id);
        }
    }
}

/// RAII registration of one session.
pub struct Registration {
    registry: SessionRegistry,
    id: SessionId,
}

impl Registration {
    /// The registered session id.
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
