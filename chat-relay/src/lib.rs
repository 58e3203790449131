// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay
//!
//! Relays JSON chat envelopes between WebSocket clients and a backend
//! service. Every client session gets its own backend connection, which is
//! re-established with a linear backoff whenever it drops.

pub mod backend;
pub mod backend_stub;
pub mod config;
pub mod connection_limit;
pub mod envelope;
pub mod error;
pub mod http;
pub mod metrics;
pub mod mock;
pub mod relay;
pub mod server;
pub mod session;

pub use backend::{BackendConnector, BackendEvent, BackendLink, BackendState, Dialer, WsDialer};
pub use config::RelayConfig;
pub use envelope::Envelope;
pub use error::{BackendError, ConfigError, DecodeError, ForwardError, RelayError};
pub use metrics::RelayMetrics;
pub use server::{RelayServer, ShutdownHandle};
pub use session::{SessionId, SessionRegistry};
