// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay error types.

use std::io;

use thiserror::Error;

/// A client frame that cannot be relayed to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("message is not valid JSON: {0}")]
    Malformed(String),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("message requires a non-empty \"text\" field")]
    MissingText,

    #[error("message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

/// Failure of the backend connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    Connect(String),

    #[error("{0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => BackendError::Closed,
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Why a client message was not delivered to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("backend is not connected")]
    BackendUnavailable,

    #[error("backend send failed: {0}")]
    Transport(#[from] BackendError),
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-level relay failure.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
