// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Router and Session Lifecycle
//!
//! One task per session multiplexes the client socket, the backend
//! connector and the shutdown signal. Each direction is handled in arrival
//! order; a client message that cannot reach the backend is answered with a
//! synthesized envelope and dropped. The session ends only when the client
//! goes away (or the server shuts down), and ending it closes the backend.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnector, BackendEvent, Dialer};
use crate::config::RelayConfig;
use crate::envelope::{self, Envelope};
use crate::error::{BackendError, ForwardError};
use crate::metrics::{RelayMetrics, TO_BACKEND, TO_CLIENT};
use crate::session::SessionId;

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base delay of the linear reconnect backoff.
    pub reconnect_base_delay: Duration,
    /// Largest accepted client frame in bytes.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for SessionConfig {
    fn from(config: &RelayConfig) -> Self {
        SessionConfig {
            reconnect_base_delay: config.reconnect_base_delay(),
            max_message_size: config.max_message_size,
        }
    }
}

/// Everything a session task needs besides its client socket.
pub struct SessionContext {
    pub dialer: Arc<dyn Dialer>,
    pub config: SessionConfig,
    pub metrics: RelayMetrics,
    /// Set to `true` (or closed) when the server shuts down.
    pub shutdown: watch::Receiver<bool>,
}

struct Session<S> {
    id: SessionId,
    client: SplitSink<WebSocketStream<S>, Message>,
    client_open: bool,
    backend: BackendConnector,
    config: SessionConfig,
    metrics: RelayMetrics,
}

/// Resolves once shutdown is signalled, even if that happened before the
/// call. A dropped sender also counts.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs one session until the client disconnects or shutdown is signalled.
pub async fn run_session<S>(ws: WebSocketStream<S>, id: SessionId, ctx: SessionContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SessionContext {
        dialer,
        config,
        metrics,
        mut shutdown,
    } = ctx;

    let started = Instant::now();
    let (client, mut client_rx) = ws.split();
    let backend = BackendConnector::start(id, dialer, config.reconnect_base_delay);
    let mut session = Session {
        id,
        client,
        client_open: true,
        backend,
        config,
        metrics,
    };

    debug!(session = %id, "Session started, connecting to backend");

    loop {
        tokio::select! {
            frame = client_rx.next() => match frame {
                Some(Ok(message)) => {
                    if session.handle_client_frame(message).await.is_break() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "Client connection error");
                    break;
                }
                None => break,
            },
            event = session.backend.next_event() => session.handle_backend_event(event).await,
            _ = shutdown_signalled(&mut shutdown) => {
                session.close_client().await;
                break;
            }
        }

        // A client that can no longer be written to is gone.
        if !session.client_open {
            break;
        }
    }

    session.client_open = false;
    session.backend.close().await;
    debug!(
        session = %id,
        duration_ms = started.elapsed().as_millis() as u64,
        "Session closed"
    );
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn handle_client_frame(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Text(text) => self.relay_client_payload(text.as_bytes()).await,
            Message::Binary(data) => self.relay_client_payload(&data).await,
            Message::Close(_) => {
                debug!(session = %self.id, "Client sent close");
                // Flushes the close reply queued by tungstenite.
                self.close_client().await;
                return ControlFlow::Break(());
            }
            // Ping/pong are answered by tungstenite.
            _ => {}
        }
        ControlFlow::Continue(())
    }

    async fn relay_client_payload(&mut self, data: &[u8]) {
        match envelope::decode_client_frame(data, self.config.max_message_size) {
            Ok(envelope) => self.forward_to_backend(envelope).await,
            Err(err) => {
                warn!(session = %self.id, error = %err, "Rejected client message");
                self.metrics.client_decode_errors.inc();
                self.forward_to_client(&Envelope::client_error(&err)).await;
            }
        }
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Opened => {
                self.metrics.backend_connects.inc();
                info!(session = %self.id, "Backend connected");
            }
            BackendEvent::Message(raw) => {
                let envelope = envelope::decode_backend(&raw);
                if self.forward_to_client(&envelope).await {
                    self.metrics.relayed(TO_CLIENT);
                }
            }
            BackendEvent::Failed { error, retry_in } => {
                self.metrics.backend_errors.inc();
                self.metrics.backend_reconnects.inc();
                warn!(
                    session = %self.id,
                    %error,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Backend error"
                );
                self.forward_to_client(&Envelope::backend_error(&error)).await;
            }
            BackendEvent::Closed { retry_in } => {
                self.metrics.backend_reconnects.inc();
                info!(
                    session = %self.id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Backend disconnected"
                );
            }
            BackendEvent::Redialing { attempt } => {
                debug!(session = %self.id, attempt, "Reconnecting to backend");
            }
        }
    }

    /// Forwards a validated client envelope, or tells the client why not.
    async fn forward_to_backend(&mut self, envelope: Envelope) {
        match self.backend.forward(envelope.encode()).await {
            Ok(()) => {
                self.metrics.relayed(TO_BACKEND);
                debug!(session = %self.id, "Forwarded client message to backend");
            }
            Err(ForwardError::BackendUnavailable) => {
                self.metrics.backend_unavailable.inc();
                debug!(
                    session = %self.id,
                    state = ?self.backend.state(),
                    "Dropped client message, backend not connected"
                );
                self.forward_to_client(&Envelope::backend_disconnected()).await;
            }
            Err(ForwardError::Transport(BackendError::Closed)) => {
                self.metrics.backend_unavailable.inc();
                self.metrics.backend_reconnects.inc();
                info!(session = %self.id, "Backend closed while sending, message dropped");
                self.forward_to_client(&Envelope::backend_disconnected()).await;
            }
            Err(ForwardError::Transport(error)) => {
                self.metrics.backend_errors.inc();
                self.metrics.backend_reconnects.inc();
                warn!(session = %self.id, %error, "Backend send failed");
                self.forward_to_client(&Envelope::backend_error(&error)).await;
            }
        }
    }

    /// Sends an envelope to the client. No-op once the client is gone.
    async fn forward_to_client(&mut self, envelope: &Envelope) -> bool {
        if !self.client_open {
            return false;
        }
        match self.client.send(Message::Text(envelope.encode())).await {
            Ok(()) => true,
            Err(e) => {
                debug!(session = %self.id, error = %e, "Client send failed");
                self.client_open = false;
                false
            }
        }
    }

    async fn close_client(&mut self) {
        if !self.client_open {
            return;
        }
        self.client_open = false;
        if let Err(e) = self.client.close().await {
            debug!(session = %self.id, error = %e, "Client close failed");
        }
    }
}
