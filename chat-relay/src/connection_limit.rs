// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Limiting
//!
//! Caps concurrent client connections. A slot is held by a guard for the
//! lifetime of the connection and released when the guard drops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of active connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionLimiter {
    /// Creates a limiter allowing `max_connections` concurrent connections.
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Takes a slot, or returns `None` at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_connections).then_some(active + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active: Arc::clone(&self.active),
            })
    }

    /// Number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Holds one connection slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_rejects_at_capacity() {
        let limiter = ConnectionLimiter::new(2);
        let first = limiter.try_acquire();
        let second = limiter.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.active_count(), 2);
    }

    #[test]
    fn test_dropping_guard_frees_slot() {
        let limiter = ConnectionLimiter::new(1);
        let guard = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());

        drop(guard);
        assert_eq!(limiter.active_count(), 0);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_clones_share_count() {
        let limiter = ConnectionLimiter::new(3);
        let clone = limiter.clone();
        let _guard = clone.try_acquire().unwrap();
        assert_eq!(limiter.active_count(), 1);
    }
}
