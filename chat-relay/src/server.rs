// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server
//!
//! Owns the client-facing listener and the session registry. `bind` is the
//! init step, `run` the accept loop; after `ShutdownHandle::shutdown` the
//! loop stops accepting, every session closes its client and backend, and
//! `run` returns once all session tasks are done.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::backend::Dialer;
use crate::config::RelayConfig;
use crate::connection_limit::ConnectionLimiter;
use crate::error::RelayError;
use crate::http::HealthResponse;
use crate::metrics::RelayMetrics;
use crate::relay::{run_session, shutdown_signalled, SessionConfig, SessionContext};
use crate::session::{SessionId, SessionRegistry};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Stops a running `RelayServer`.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stops accepting and closes all sessions.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Client-facing relay server.
pub struct RelayServer {
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    session_config: SessionConfig,
    registry: SessionRegistry,
    metrics: RelayMetrics,
    limiter: ConnectionLimiter,
    shutdown: Arc<watch::Sender<bool>>,
    start_time: Instant,
}

impl RelayServer {
    /// Binds the client listener.
    pub async fn bind(
        config: &RelayConfig,
        dialer: Arc<dyn Dialer>,
        metrics: RelayMetrics,
    ) -> Result<Self, RelayError> {
        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|source| RelayError::Bind {
                    addr: config.listen_addr.to_string(),
                    source,
                })?;
        let (shutdown, _) = watch::channel(false);

        Ok(RelayServer {
            listener,
            dialer,
            session_config: SessionConfig::from(config),
            registry: SessionRegistry::new(),
            metrics,
            limiter: ConnectionLimiter::new(config.max_connections),
            shutdown: Arc::new(shutdown),
            start_time: Instant::now(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry of open sessions.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Accepts clients until shutdown, then waits for all sessions to end.
    pub async fn run(self) -> Result<(), RelayError> {
        let addr = self.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        info!("WebSocket server listening on {}", addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(&mut sessions, stream, peer),
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        self.metrics.connection_errors.inc();
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }

        info!(sessions = sessions.len(), "Shutting down, closing sessions");
        let RelayServer {
            listener, shutdown, ..
        } = self;
        drop(listener);
        shutdown.send_replace(true);

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task failed");
            }
        }
        info!("Relay server stopped");
        Ok(())
    }

    fn spawn_connection(&self, sessions: &mut JoinSet<()>, mut stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.limiter.try_acquire() else {
            warn!(
                "Connection rejected from {}: at max capacity ({}/{})",
                peer,
                self.limiter.active_count(),
                self.limiter.max_connections()
            );
            self.metrics.connection_errors.inc();
            return;
        };

        let ctx = SessionContext {
            dialer: Arc::clone(&self.dialer),
            config: self.session_config.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let registry = self.registry.clone();
        let start_time = self.start_time;

        sessions.spawn(async move {
            // Keep the slot for the duration of the connection
            let _slot = slot;
            let metrics = ctx.metrics.clone();
            let mut shutdown = ctx.shutdown.clone();

            let handshake = async {
                if answer_health_check(&mut stream, start_time).await {
                    return None;
                }
                Some(accept_async(stream).await)
            };
            let accepted = tokio::select! {
                accepted = handshake => accepted,
                _ = shutdown_signalled(&mut shutdown) => None,
            };

            match accepted {
                Some(Ok(ws)) => {
                    let id = SessionId::new();
                    let _registration = registry.register(id, peer);
                    metrics.sessions_total.inc();
                    metrics.sessions_active.inc();
                    info!(session = %id, %peer, "Client connected");

                    run_session(ws, id, ctx).await;

                    metrics.sessions_active.dec();
                    info!(session = %id, %peer, "Client disconnected");
                }
                Some(Err(e)) => {
                    error!("WebSocket handshake failed for {}: {}", peer, e);
                    metrics.connection_errors.inc();
                }
                None => {}
            }
        });
    }
}

/// Answers plain `GET /health` or `GET /up` requests on the WebSocket port.
///
/// Returns true if the connection was a health check and has been handled.
async fn answer_health_check(stream: &mut TcpStream, start_time: Instant) -> bool {
    let mut peek_buf = [0u8; 64];
    let n = match stream.peek(&mut peek_buf).await {
        Ok(n) if n > 0 => n,
        _ => return false,
    };

    let head = String::from_utf8_lossy(&peek_buf[..n]);
    let is_health_check = (head.starts_with("GET /health") || head.starts_with("GET /up"))
        && !head.contains("Upgrade:");
    if !is_health_check {
        return false;
    }

    let body = serde_json::to_string(&HealthResponse::healthy(start_time)).unwrap_or_default();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    // Drain the request so closing does not reset the connection.
    let mut request = [0u8; 1024];
    if let Err(e) = stream.try_read(&mut request) {
        debug!(error = %e, "Failed to drain health check request");
    }

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!(error = %e, "Failed to answer health check");
    }
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Failed to close health check connection");
    }
    true
}
