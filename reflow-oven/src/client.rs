//! Device client: connection lifecycle, commands and status polling.
//!
//! [`CommunicationService`] is the seam the engine depends on. [`OvenClient`]
//! implements it over TCP using a [`Session`] and the line protocol.
//!
//! # Connection state
//!
//! ```text
//!                connect ok
//!  Disconnected ────────────► Connected
//!     ▲   │                      │
//!     │   │ connect              │ disconnect / liveness lost
//!     │   ▼                      │
//!     │ Connecting               │
//!     │   │ connect failed       │
//!     └───┴──────────────────────┘
//! ```
//!
//! `Connecting` is transient; outside observers only see the boolean
//! emitted by [`connect`](CommunicationService::connect).
//!
//! Every connect and disconnect bumps a session generation. A status stream
//! is bound to the generation that was current when it was created and ends
//! as soon as that generation is gone, so a stale poller can never start
//! polling a newer session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex as SyncMutex;
use strum::Display;
use tokio::sync::Mutex;
use tokio::time;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol;
use crate::tracing::prelude::*;
use crate::transport::Session;
use crate::types::{OvenState, ReflowProfile};

/// Operations the engine needs from a device connection.
#[async_trait]
pub trait CommunicationService: Send + Sync + 'static {
    /// Open a session. The stream yields exactly one value, `true` on
    /// success and `false` on any failure, then completes. Never retries.
    fn connect(&self, host: &str, port: u16) -> BoxStream<'static, bool>;

    /// Close the active session, if any. Idempotent.
    async fn disconnect(&self);

    /// Upload a profile without starting it.
    async fn send_profile(&self, profile: &ReflowProfile) -> Result<(), TransportError>;

    /// Upload a profile and start it.
    async fn start_oven(&self, profile: &ReflowProfile) -> Result<(), TransportError>;

    /// Abort the current run.
    async fn stop_oven(&self) -> Result<(), TransportError>;

    /// Poll the current session for telemetry.
    ///
    /// The stream ends when the session it was created for is closed,
    /// replaced or found dead. It does not reconnect.
    fn oven_states(&self) -> BoxStream<'static, OvenState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// TCP implementation of [`CommunicationService`].
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct OvenClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,

    /// At most one open session. Held across I/O so commands and polls
    /// never interleave on the wire.
    session: Mutex<Option<Session>>,

    /// Bumped on every connect and disconnect, under the session lock.
    generation: AtomicU64,

    state: SyncMutex<ConnectionState>,
}

impl OvenClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                state: SyncMutex::new(ConnectionState::Disconnected),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }
}

impl Default for OvenClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        let previous = *current;
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            *current = state;
        }
    }

    /// Record that the session of `generation` has died, unless a newer
    /// session has already replaced it.
    fn mark_lost(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn connect(&self, host: &str, port: u16) -> bool {
        let mut slot = self.session.lock().await;

        // Exactly one socket at a time: the old one goes before the new one
        // is opened.
        if let Some(mut previous) = slot.take() {
            info!(peer = %previous.peer(), "Closing previous session before reconnecting");
            previous.close().await;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::Connecting);

        match Session::open(
            host,
            port,
            self.config.connect_timeout,
            self.config.max_line_length,
        )
        .await
        {
            Ok(session) => {
                info!(peer = %session.peer(), "Connected to oven");
                *slot = Some(session);
                self.set_state(ConnectionState::Connected);
                true
            }
            Err(e) => {
                warn!(host, port, error = %e, "Connection failed");
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        self.generation.fetch_add(1, Ordering::AcqRel);

        match slot.take() {
            Some(mut session) => {
                session.close().await;
                info!(peer = %session.peer(), "Disconnected from oven");
            }
            None => debug!("Disconnect requested with no active session"),
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn send_command(&self, line: String) -> Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            debug!(command = %line, "Dropping command, not connected");
            return Err(TransportError::NotConnected);
        };

        match session.write_line(&line).await {
            Ok(()) => {
                debug!(command = %line, "Sent command");
                Ok(())
            }
            Err(e) => {
                warn!(command = %line, error = %e, "Failed to send command");
                self.mark_lost(self.generation.load(Ordering::Acquire));
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CommunicationService for OvenClient {
    fn connect(&self, host: &str, port: u16) -> BoxStream<'static, bool> {
        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        stream::once(async move { shared.connect(&host, port).await }).boxed()
    }

    async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    async fn send_profile(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
        self.shared
            .send_command(protocol::encode_send_profile(profile))
            .await
    }

    async fn start_oven(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
        self.shared.send_command(protocol::encode_start(profile)).await
    }

    async fn stop_oven(&self) -> Result<(), TransportError> {
        self.shared.send_command(protocol::encode_stop()).await
    }

    fn oven_states(&self) -> BoxStream<'static, OvenState> {
        let poller = Poller {
            shared: Arc::clone(&self.shared),
            generation: self.shared.generation.load(Ordering::Acquire),
            pending: VecDeque::new(),
            first_cycle: true,
        };

        stream::unfold(poller, |mut poller| async move {
            poller.next_state().await.map(|state| (state, poller))
        })
        .boxed()
    }
}

/// State of one status stream.
struct Poller {
    shared: Arc<Shared>,
    generation: u64,
    /// Decoded snapshots not yet handed out, oldest first.
    pending: VecDeque<OvenState>,
    first_cycle: bool,
}

impl Poller {
    async fn next_state(&mut self) -> Option<OvenState> {
        loop {
            if let Some(state) = self.pending.pop_front() {
                return Some(state);
            }

            if !self.first_cycle {
                time::sleep(self.shared.config.poll_interval).await;
            }
            self.first_cycle = false;

            if !self.poll_once().await {
                debug!(generation = self.generation, "Status stream ended");
                return None;
            }
        }
    }

    /// Run one query/read/decode cycle. Returns false once the session this
    /// poller belongs to is gone.
    async fn poll_once(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut slot = shared.session.lock().await;

        if shared.generation.load(Ordering::Acquire) != self.generation {
            return false;
        }
        let Some(session) = slot.as_mut() else {
            return false;
        };
        if !session.is_alive() {
            shared.mark_lost(self.generation);
            return false;
        }

        if let Err(e) = session.write_line(&protocol::encode_status_query()).await {
            warn!(error = %e, "Status query failed");
            shared.mark_lost(self.generation);
            return false;
        }

        match session
            .read_line_if_available(shared.config.response_window)
            .await
        {
            Ok(Some(line)) => {
                self.decode(&line);
                // Replies to START/STOP land here too; take them now rather
                // than lagging a cycle behind.
                for line in session.drain_buffered_lines() {
                    self.decode(&line);
                }
            }
            Ok(None) if !session.is_alive() => {
                shared.mark_lost(self.generation);
                return false;
            }
            Ok(None) => trace!("No status reply this cycle"),
            Err(e) => {
                warn!(error = %e, "Status read failed");
                shared.mark_lost(self.generation);
                return false;
            }
        }

        true
    }

    fn decode(&mut self, line: &str) {
        match protocol::decode_status_line(line) {
            Ok(state) => self.pending.push_back(state),
            Err(e) => debug!(line, error = %e, "Ignoring undecodable line"),
        }
    }
}
