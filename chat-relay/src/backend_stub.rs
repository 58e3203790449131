// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Development Backend
//!
//! A stand-in processing service for local runs and end-to-end tests. It
//! accepts WebSocket connections on any path and answers every
//! `{"text": ...}` message with a canned reply.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;

/// Default listen address of the development backend.
pub const DEFAULT_STUB_ADDR: &str = "127.0.0.1:8000";

/// Reply sent when a message cannot be parsed.
pub const PARSE_ERROR_REPLY: &str = "Error processing your message. Please try again.";

/// Reply for texts without a canned answer.
pub const FALLBACK_REPLY: &str = "I'm not sure about that, but I can help with paper manufacturing queries! Try asking about production or quality control.";

const CANNED_REPLIES: &[(&str, &str)] = &[
    (
        "hello",
        "Hi there! How can I assist you with paper manufacturing today?",
    ),
    (
        "paper manufacturing",
        "Modern paper manufacturing involves processes like pulping, refining, and pressing. Want details on any specific step?",
    ),
    (
        "production optimization",
        "To optimize your paper production line, focus on automation, real-time monitoring, and reducing waste. Need specific tips?",
    ),
    (
        "quality control",
        "Best practices for paper quality control include regular testing for tensile strength, thickness, and moisture content. Want more details?",
    ),
    (
        "troubleshooting",
        "Common papermaking issues include paper jams, uneven coating, or machine downtime. Describe your issue for specific advice!",
    ),
];

/// Canned answer for a user text (matched case-insensitively).
pub fn reply_for(text: &str) -> &'static str {
    let key = text.to_lowercase();
    CANNED_REPLIES
        .iter()
        .find(|(question, _)| *question == key)
        .map(|(_, answer)| *answer)
        .unwrap_or(FALLBACK_REPLY)
}

/// Builds the reply envelope for one raw message.
pub fn respond(raw: &str) -> Envelope {
    let text = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("text").and_then(Value::as_str).map(str::to_owned));

    match text {
        Some(text) => Envelope::with_text(reply_for(&text)),
        None => {
            warn!("Backend stub could not parse message");
            Envelope::with_text(PARSE_ERROR_REPLY)
        }
    }
}

/// Serves connections from `listener` until the task is dropped.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!("Backend stub listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, peer));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Backend stub handshake failed for {}: {}", peer, e);
            return;
        }
    };
    info!(%peer, "Relay connected to backend stub");

    let (mut tx, mut rx) = ws.split();
    while let Some(Ok(message)) = rx.next().await {
        let raw = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        debug!(%peer, "Backend stub received message");

        if tx.send(Message::Text(respond(&raw).encode())).await.is_err() {
            break;
        }
    }
    info!(%peer, "Relay disconnected from backend stub");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_question_gets_canned_answer() {
        assert_eq!(
            reply_for("hello"),
            "Hi there! How can I assist you with paper manufacturing today?"
        );
        assert!(reply_for("Quality Control").starts_with("Best practices"));
    }

    #[test]
    fn test_unknown_question_gets_fallback() {
        assert_eq!(reply_for("what is the weather"), FALLBACK_REPLY);
        assert_eq!(reply_for(" hello "), FALLBACK_REPLY);
    }

    #[test]
    fn test_respond_wraps_answer() {
        let reply = respond(r#"{"text":"troubleshooting","user":"ana"}"#);
        assert!(reply.text().unwrap().starts_with("Common papermaking issues"));
        assert_eq!(reply.fields().len(), 1);
    }

    #[test]
    fn test_unparseable_message_gets_error_reply() {
        assert_eq!(respond("not json").text(), Some(PARSE_ERROR_REPLY));
        assert_eq!(respond(r#"{"text":42}"#).text(), Some(PARSE_ERROR_REPLY));
        assert_eq!(respond(r#"{"other":"x"}"#).text(), Some(PARSE_ERROR_REPLY));
    }
}
