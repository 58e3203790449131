// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Configuration
//!
//! Loaded from `RELAY_*` environment variables with defaults.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_CONNECTIONS: usize = 1_000;

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Client-facing WebSocket listener.
    pub listen_addr: SocketAddr,
    /// Health and metrics HTTP listener.
    pub http_addr: SocketAddr,
    /// Backend base URL; each session connects to `<backend_url>/<session id>`.
    pub backend_url: String,
    /// Base delay of the linear reconnect backoff (milliseconds).
    pub reconnect_base_delay_ms: u64,
    /// Largest accepted client frame in bytes.
    pub max_message_size: usize,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Bearer token required by `/metrics`, if set.
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = RelayConfig {
            listen_addr: parse_or(&lookup, "RELAY_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?,
            http_addr: parse_or(&lookup, "RELAY_HTTP_ADDR", DEFAULT_HTTP_ADDR)?,
            backend_url: lookup("RELAY_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            reconnect_base_delay_ms: parse_or(
                &lookup,
                "RELAY_RECONNECT_BASE_MS",
                &DEFAULT_RECONNECT_BASE_MS.to_string(),
            )?,
            max_message_size: parse_or(
                &lookup,
                "RELAY_MAX_MESSAGE_SIZE",
                &DEFAULT_MAX_MESSAGE_SIZE.to_string(),
            )?,
            max_connections: parse_or(
                &lookup,
                "RELAY_MAX_CONNECTIONS",
                &DEFAULT_MAX_CONNECTIONS.to_string(),
            )?,
            metrics_token: lookup("RELAY_METRICS_TOKEN").filter(|t| !t.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backend_url.starts_with("ws://") || self.backend_url.starts_with("wss://")) {
            return Err(invalid(
                "RELAY_BACKEND_URL",
                &self.backend_url,
                "expected ws:// or wss:// URL",
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(invalid("RELAY_RECONNECT_BASE_MS", "0", "must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(invalid("RELAY_MAX_MESSAGE_SIZE", "0", "must be positive"));
        }
        if self.max_connections == 0 {
            return Err(invalid("RELAY_MAX_CONNECTIONS", "0", "must be positive"));
        }
        Ok(())
    }

    /// Base delay of the linear reconnect backoff.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &raw, &e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
