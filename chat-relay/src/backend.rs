// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Backend Connector
//!
//! Owns the single backend connection of a session and keeps moving it
//! toward `Open`:
//!
//! ```text
//! Connecting --ok--> Open --close/error--> Reconnecting --timer--> Connecting
//!     |                                         ^
//!     +------------------fail-------------------+
//! any state --client gone--> Closed
//! ```
//!
//! The retry delay grows linearly (`base * attempt`) without a ceiling and
//! the attempt counter resets on every successful open. The reconnect timer
//! lives inside the `Reconnecting` state, so it exists exactly while the
//! connector is reconnecting and is cancelled by leaving that state.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::debug;

use crate::error::{BackendError, ForwardError};
use crate::session::SessionId;

/// Upper bound for the close handshake with the backend on teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound half of a backend connection.
pub type BackendSink = Pin<Box<dyn Sink<String, Error = BackendError> + Send>>;

/// Inbound half of a backend connection.
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// One established backend connection, as text frames in both directions.
pub struct BackendLink {
    sink: BackendSink,
    stream: BackendStream,
}

impl BackendLink {
    /// Wraps an arbitrary sink/stream pair.
    pub fn new(sink: BackendSink, stream: BackendStream) -> Self {
        BackendLink { sink, stream }
    }

    /// Adapts a WebSocket connection. Binary frames are read as lossy UTF-8,
    /// control frames are left to tungstenite.
    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(BackendError::from)
            .with(|text: String| future::ready(Ok::<_, BackendError>(Message::Text(text))));

        let stream = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(BackendError::from(e))),
            })
        });

        BackendLink::new(Box::pin(sink), Box::pin(stream))
    }
}

/// Opens backend connections addressed by session id.
pub trait Dialer: Send + Sync + 'static {
    /// Starts one connection attempt for the given session.
    fn dial(&self, session: &SessionId) -> BoxFuture<'static, Result<BackendLink, BackendError>>;
}

/// Dials the backend over WebSocket, appending the session id to the base URL.
#[derive(Debug, Clone)]
pub struct WsDialer {
    base_url: String,
}

impl WsDialer {
    /// Creates a dialer for `ws://` or `wss://` base URLs.
    pub fn new(base_url: impl Into<String>) -> Self {
        WsDialer {
            base_url: base_url.into(),
        }
    }

    /// Connection target for a session: `<base>/<session id>`.
    pub fn session_url(&self, session: &SessionId) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), session)
    }
}

impl Dialer for WsDialer {
    fn dial(&self, session: &SessionId) -> BoxFuture<'static, Result<BackendLink, BackendError>> {
        let url = self.session_url(session);
        Box::pin(async move {
            let (ws, _response) = connect_async(url)
                .await
                .map_err(|e| BackendError::Connect(e.to_string()))?;
            Ok(BackendLink::from_websocket(ws))
        })
    }
}

/// Linear backoff: the n-th consecutive retry waits `base * n`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Backoff { base, attempts: 0 }
    }

    /// Counts one more attempt and returns its delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(self.attempts)
    }

    /// Clears the attempt counter after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Retries counted since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Backend sub-state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// An open attempt is in flight.
    Connecting,
    /// Connected; backend messages flow to the client.
    Open,
    /// Waiting for the retry timer.
    Reconnecting,
    /// Terminal; the client connection is gone.
    Closed,
}

/// What happened on the backend side.
#[derive(Debug)]
pub enum BackendEvent {
    /// The connection attempt succeeded.
    Opened,
    /// A frame from the backend.
    Message(String),
    /// The attempt or the open connection failed; a retry is scheduled.
    Failed {
        error: BackendError,
        retry_in: Duration,
    },
    /// The backend closed the connection; a retry is scheduled.
    Closed { retry_in: Duration },
    /// The retry timer fired and a new attempt started.
    Redialing { attempt: u32 },
}

enum Slot {
    Connecting(BoxFuture<'static, Result<BackendLink, BackendError>>),
    Open(BackendLink),
    Reconnecting { timer: Pin<Box<Sleep>>, delay: Duration },
    Closed,
}

enum Step {
    Dialed(Result<BackendLink, BackendError>),
    Frame(Option<Result<String, BackendError>>),
    RetryDue,
}

/// Backend connection lifecycle of one session.
pub struct BackendConnector {
    session_id: SessionId,
    dialer: Arc<dyn Dialer>,
    backoff: Backoff,
    slot: Slot,
}

impl BackendConnector {
    /// Starts the first connection attempt for a session.
    pub fn start(session_id: SessionId, dialer: Arc<dyn Dialer>, base_delay: Duration) -> Self {
        let attempt = dialer.dial(&session_id);
        BackendConnector {
            session_id,
            dialer,
            backoff: Backoff::new(base_delay),
            slot: Slot::Connecting(attempt),
        }
    }

    pub fn state(&self) -> BackendState {
        match self.slot {
            Slot::Connecting(_) => BackendState::Connecting,
            Slot::Open(_) => BackendState::Open,
            Slot::Reconnecting { .. } => BackendState::Reconnecting,
            Slot::Closed => BackendState::Closed,
        }
    }

    /// Retries counted since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Delay of the pending retry timer, if one is scheduled.
    pub fn pending_retry(&self) -> Option<Duration> {
        match self.slot {
            Slot::Reconnecting { delay, .. } => Some(delay),
            _ => None,
        }
    }

    /// Waits for the next backend event and applies its state transition.
    ///
    /// Cancel safe: the in-flight attempt, the open link and the retry timer
    /// all live in the connector, so dropping this future loses nothing.
    /// Never resolves once the connector is closed.
    pub async fn next_event(&mut self) -> BackendEvent {
        let step = match &mut self.slot {
            Slot::Connecting(attempt) => Step::Dialed(attempt.await),
            Slot::Open(link) => Step::Frame(link.stream.next().await),
            Slot::Reconnecting { timer, .. } => {
                timer.as_mut().await;
                Step::RetryDue
            }
            Slot::Closed => return future::pending::<BackendEvent>().await,
        };

        match step {
            Step::Dialed(Ok(link)) => {
                self.backoff.reset();
                self.slot = Slot::Open(link);
                BackendEvent::Opened
            }
            Step::Dialed(Err(error)) | Step::Frame(Some(Err(error)))
                if error != BackendError::Closed =>
            {
                let retry_in = self.schedule_retry();
                BackendEvent::Failed { error, retry_in }
            }
            Step::Dialed(Err(_)) | Step::Frame(Some(Err(_))) | Step::Frame(None) => {
                let retry_in = self.schedule_retry();
                BackendEvent::Closed { retry_in }
            }
            Step::Frame(Some(Ok(text))) => BackendEvent::Message(text),
            Step::RetryDue => {
                debug!(session = %self.session_id, attempt = self.backoff.attempts(), "Redialing backend");
                self.slot = Slot::Connecting(self.dialer.dial(&self.session_id));
                BackendEvent::Redialing {
                    attempt: self.backoff.attempts(),
                }
            }
        }
    }

    /// Sends one text frame to the backend.
    ///
    /// Refused unless the connection is open; nothing is queued. A failed
    /// send drops the connection and schedules a retry.
    pub async fn forward(&mut self, text: String) -> Result<(), ForwardError> {
        let Slot::Open(link) = &mut self.slot else {
            return Err(ForwardError::BackendUnavailable);
        };

        if let Err(error) = link.sink.send(text).await {
            let retry_in = self.schedule_retry();
            debug!(session = %self.session_id, %error, ?retry_in, "Backend send failed");
            return Err(ForwardError::Transport(error));
        }
        Ok(())
    }

    /// Enters the terminal state: cancels the retry timer or the in-flight
    /// attempt, and closes the open connection.
    pub async fn close(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Open(mut link) => {
                match tokio::time::timeout(CLOSE_TIMEOUT, link.sink.close()).await {
                    Ok(Ok(())) => debug!(session = %self.session_id, "Backend connection closed"),
                    Ok(Err(error)) => {
                        debug!(session = %self.session_id, %error, "Backend close failed")
                    }
                    Err(_) => debug!(session = %self.session_id, "Backend close timed out"),
                }
            }
            Slot::Reconnecting { delay, .. } => {
                debug!(session = %self.session_id, ?delay, "Cancelled pending reconnect")
            }
            Slot::Connecting(_) => {
                debug!(session = %self.session_id, "Abandoned backend connection attempt")
            }
            Slot::Closed => {}
        }
    }

    fn schedule_retry(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        // Replacing the slot drops any previous link before the timer exists.
        self.slot = Slot::Reconnecting {
            timer: Box::pin(tokio::time::sleep(delay)),
            delay,
        };
        delay
    }
}
