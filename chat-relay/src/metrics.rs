// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics
//!
//! Counters and gauges for sessions, backend connections and relayed
//! messages, exported in the Prometheus text format.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Label value for client-to-backend traffic.
pub const TO_BACKEND: &str = "client_to_backend";
/// Label value for backend-to-client traffic.
pub const TO_CLIENT: &str = "backend_to_client";

/// Relay metrics, cheap to clone (all handles share one registry).
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    pub sessions_total: IntCounter,
    pub sessions_active: IntGauge,
    pub connection_errors: IntCounter,
    pub backend_connects: IntCounter,
    pub backend_reconnects: IntCounter,
    pub backend_errors: IntCounter,
    pub messages_relayed: IntCounterVec,
    pub client_decode_errors: IntCounter,
    pub backend_unavailable: IntCounter,
}

impl RelayMetrics {
    /// Creates and registers all relay metrics.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "relay_sessions_total",
            "Client sessions accepted since start",
        )?;
        let sessions_active = IntGauge::new("relay_sessions_active", "Currently open sessions")?;
        let connection_errors = IntCounter::new(
            "relay_connection_errors_total",
            "Client connections rejected or failed during handshake",
        )?;
        let backend_connects = IntCounter::new(
            "relay_backend_connects_total",
            "Successful backend connection opens",
        )?;
        let backend_reconnects = IntCounter::new(
            "relay_backend_reconnects_total",
            "Backend reconnects scheduled",
        )?;
        let backend_errors = IntCounter::new(
            "relay_backend_errors_total",
            "Backend transport and connect errors",
        )?;
        let messages_relayed = IntCounterVec::new(
            Opts::new("relay_messages_relayed_total", "Messages relayed by direction"),
            &["direction"],
        )?;
        let client_decode_errors = IntCounter::new(
            "relay_client_decode_errors_total",
            "Client messages rejected as malformed",
        )?;
        let backend_unavailable = IntCounter::new(
            "relay_backend_unavailable_total",
            "Client messages dropped because the backend was not connected",
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;
        registry.register(Box::new(backend_connects.clone()))?;
        registry.register(Box::new(backend_reconnects.clone()))?;
        registry.register(Box::new(backend_errors.clone()))?;
        registry.register(Box::new(messages_relayed.clone()))?;
        registry.register(Box::new(client_decode_errors.clone()))?;
        registry.register(Box::new(backend_unavailable.clone()))?;

        Ok(RelayMetrics {
            registry,
            sessions_total,
            sessions_active,
            connection_errors,
            backend_connects,
            backend_reconnects,
            backend_errors,
            messages_relayed,
            client_decode_errors,
            backend_unavailable,
        })
    }

    /// Counts one relayed message in the given direction.
    pub fn relayed(&self, direction: &str) {
        self.messages_relayed.with_label_values(&[direction]).inc();
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
