// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mock Backend Dialer
//!
//! In-memory `Dialer` for tests. Each accepted dial hands the test a
//! `MockBackend` that sees everything the relay sends and can reply, fail
//! or close. Dial attempts are timestamped with `tokio::time::Instant`, so
//! paused-clock tests observe exact backoff delays.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, BoxFuture};
use futures_util::{sink, stream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{BackendLink, Dialer};
use crate::error::BackendError;
use crate::session::SessionId;

/// Result of one scripted dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// Open a connection.
    Accept,
    /// Fail the attempt with a connect error.
    Refuse(String),
}

impl DialOutcome {
    pub fn refuse(reason: impl Into<String>) -> Self {
        DialOutcome::Refuse(reason.into())
    }
}

#[derive(Debug)]
struct DialerState {
    script: VecDeque<DialOutcome>,
    fallback: DialOutcome,
    dials: Vec<(SessionId, Instant)>,
    live: usize,
    max_live: usize,
}

/// Scripted in-memory dialer.
#[derive(Debug)]
pub struct MockDialer {
    state: Arc<Mutex<DialerState>>,
    accepted: mpsc::UnboundedSender<MockBackend>,
}

/// Backends accepted by a `MockDialer`, in dial order.
pub struct MockBackends {
    rx: mpsc::UnboundedReceiver<MockBackend>,
}

impl MockBackends {
    /// Waits for the next accepted connection.
    pub async fn next(&mut self) -> Option<MockBackend> {
        self.rx.recv().await
    }
}

impl MockDialer {
    /// Dialer that plays `script` first, then answers every dial with `fallback`.
    pub fn with_script(
        script: Vec<DialOutcome>,
        fallback: DialOutcome,
    ) -> (Arc<Self>, MockBackends) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = MockDialer {
            state: Arc::new(Mutex::new(DialerState {
                script: script.into(),
                fallback,
                dials: Vec::new(),
                live: 0,
                max_live: 0,
            })),
            accepted,
        };
        (Arc::new(dialer), MockBackends { rx })
    }

    /// Dialer that accepts every attempt.
    pub fn accepting() -> (Arc<Self>, MockBackends) {
        Self::with_script(Vec::new(), DialOutcome::Accept)
    }

    /// Dialer that refuses every attempt.
    pub fn refusing() -> (Arc<Self>, MockBackends) {
        Self::with_script(Vec::new(), DialOutcome::refuse("connection refused"))
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.lock().dials.len()
    }

    /// When each dial attempt started.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.lock().dials.iter().map(|(_, at)| *at).collect()
    }

    /// Session id of each dial attempt.
    pub fn dialed_sessions(&self) -> Vec<SessionId> {
        self.lock().dials.iter().map(|(id, _)| *id).collect()
    }

    /// Connections currently held by the relay.
    pub fn live_links(&self) -> usize {
        self.lock().live
    }

    /// Highest number of simultaneously held connections.
    pub fn max_live_links(&self) -> usize {
        self.lock().max_live
    }

    fn lock(&self) -> MutexGuard<'_, DialerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_link(&self, session_id: SessionId) -> BackendLink {
        let (to_backend, received) = mpsc::unbounded_channel::<String>();
        let (sender, from_backend) = mpsc::unbounded_channel::<Result<String, BackendError>>();

        {
            let mut state = self.lock();
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
        }
        let guard = LiveGuard {
            state: Arc::clone(&self.state),
        };

        let sink = sink::unfold((to_backend, guard), |(tx, guard), text: String| async move {
            tx.send(text).map_err(|_| BackendError::Closed)?;
            Ok::<_, BackendError>((tx, guard))
        });
        let stream = stream::unfold(from_backend, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        // Nobody listening for backends is fine; the link still works.
        let _ = self.accepted.send(MockBackend {
            session_id,
            received,
            sender: Some(sender),
        });

        BackendLink::new(Box::pin(sink), Box::pin(stream))
    }
}

impl Dialer for MockDialer {
    fn dial(&self, session: &SessionId) -> BoxFuture<'static, Result<BackendLink, BackendError>> {
        let outcome = {
            let mut state = self.lock();
            state.dials.push((*session, Instant::now()));
            let fallback = state.fallback.clone();
            state.script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            DialOutcome::Accept => Box::pin(future::ready(Ok(self.open_link(*session)))),
            DialOutcome::Refuse(reason) => {
                Box::pin(future::ready(Err(BackendError::Connect(reason))))
            }
        }
    }
}

struct LiveGuard {
    state: Arc<Mutex<DialerState>>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.live = state.live.saturating_sub(1);
    }
}

/// Test-side end of one accepted backend connection.
pub struct MockBackend {
    /// Session the connection was dialed for.
    pub session_id: SessionId,
    received: mpsc::UnboundedReceiver<String>,
    sender: Option<mpsc::UnboundedSender<Result<String, BackendError>>>,
}

impl MockBackend {
    /// Next frame sent by the relay; `None` once the relay dropped the link.
    pub async fn recv(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Frames already sent by the relay, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Sends a frame to the relay. Returns false if the link is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(text.into())).is_ok())
    }

    /// Injects a transport error.
    pub fn fail(&self, error: BackendError) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|tx| tx.send(Err(error)).is_ok())
    }

    /// Closes the backend side; the relay sees end of stream.
    pub fn close(&mut self) {
        self.sender = None;
    }
}
