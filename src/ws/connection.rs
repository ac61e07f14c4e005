#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use url::Url;

use super::config::{Config, LinearBackoff};
use super::traits::{
    ExecutionContext, Listener, NoopListener, Reachability, ScheduledTask, Session, Transport,
};
use super::transport::{TransportConfig, TungsteniteTransport};
use super::types::{ABNORMAL_CLOSURE, HandshakeResponse, Message, NORMAL_CLOSURE};
use crate::Result;
use crate::error::Error;

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Waiting for a session to open
    Connecting,
    /// Session open
    Connected,
    /// Waiting for a scheduled reconnect to fire
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Manages the lifecycle of one logical WebSocket connection.
///
/// The manager owns at most one transport session at a time and:
/// - opens a session on [`start`](Self::start) when the network is reachable
/// - reconnects after transport failures with linear backoff
///   (`0s, 5s, 10s, …` capped at `60s` by default)
/// - forwards text and binary frames while connected
/// - hands inbound messages to the configured main [`ExecutionContext`], which
///   publishes them to [`subscribe`](Self::subscribe) receivers, while notifying the
///   [`Listener`] directly
///
/// None of the public operations return errors; outcomes are observed through
/// [`state`](Self::state), [`state_receiver`](Self::state_receiver) and the listener.
///
/// # Example
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use resilient_ws::ws::ConnectionManager;
/// use resilient_ws::ws::config::Config;
/// use resilient_ws::ws::executor::TokioContext;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let context = Arc::new(TokioContext::new()?);
///     let connection = ConnectionManager::new(
///         Config::builder()
///             .endpoint("wss://stream.example.com/ws")
///             .main_context(context.clone())
///             .background_context(context)
///             .build(),
///     )?;
///
///     let mut messages = connection.subscribe();
///     connection.start();
///
///     while let Ok(message) = messages.recv().await {
///         println!("Received: {message:?}");
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Url,
    reconnect: bool,
    transport: Arc<dyn Transport>,
    main_context: Arc<dyn ExecutionContext>,
    background_context: Arc<dyn ExecutionContext>,
    listener: Arc<dyn Listener>,
    reachability: Arc<dyn Reachability>,
    session_lock_timeout: Duration,
    legacy_close_notification: bool,
    /// Guards every status read and write
    state: Mutex<State>,
    /// Held for the whole of a session creation so two can never overlap
    session_lock: Mutex<()>,
    next_session_id: AtomicU64,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Broadcast sender for incoming messages
    broadcast_tx: broadcast::Sender<Message>,
}

struct State {
    status: ConnectionState,
    manual_close: bool,
    /// Attempt counter and delay policy
    backoff: LinearBackoff,
    session: Option<ActiveSession>,
    pending_reconnect: Option<ScheduledTask>,
    /// Bumped on every schedule and cancel; a timer only acts if it still matches
    timer_generation: u64,
    /// Bumped by `stop`; a session creation that started before it is abandoned
    epoch: u64,
}

struct ActiveSession {
    id: u64,
    /// `None` while the transport's `open` call is still in progress
    handle: Option<Arc<dyn Session>>,
    /// Set once the transport reports the handshake completed
    opened: bool,
}

/// What made a session ask for a reconnect.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// The transport reported `failed`
    Failed,
    /// The session refused an outgoing frame while connected
    RefusedFrame,
}

impl ConnectionManager {
    /// Create a new connection manager. No connection is attempted until [`start`](Self::start).
    ///
    /// Fails if the endpoint is not a `ws://` or `wss://` URL, or if no transport was
    /// configured and the default one cannot find a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let Config {
            endpoint,
            reconnect,
            reconnect_policy,
            transport,
            main_context,
            background_context,
            listener,
            reachability,
            session_lock_timeout,
            legacy_close_notification,
        } = config;

        let endpoint = Url::parse(&endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme `{}`, expected `ws` or `wss`",
                endpoint.scheme()
            )));
        }

        let transport: Arc<dyn Transport> = match transport {
            Some(transport) => transport,
            None => Arc::new(TungsteniteTransport::new(TransportConfig::default())?),
        };
        let listener: Arc<dyn Listener> = match listener {
            Some(listener) => listener,
            None => Arc::new(NoopListener),
        };
        let reachability: Arc<dyn Reachability> = match reachability {
            Some(reachability) => reachability,
            None => Arc::new(|| true),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                reconnect,
                transport,
                main_context,
                background_context,
                listener,
                reachability,
                session_lock_timeout,
                legacy_close_notification,
                state: Mutex::new(State {
                    status: ConnectionState::Disconnected,
                    manual_close: false,
                    backoff: reconnect_policy.into(),
                    session: None,
                    pending_reconnect: None,
                    timer_generation: 0,
                    epoch: 0,
                }),
                session_lock: Mutex::new(()),
                next_session_id: AtomicU64::new(1),
                state_tx,
                broadcast_tx,
            }),
        })
    }

    /// Begin connecting. Clears a previous [`stop`](Self::stop).
    ///
    /// Does nothing while already connecting or connected, and leaves the state at
    /// [`ConnectionState::Disconnected`] when the network is unreachable.
    pub fn start(&self) {
        self.inner.state.lock().manual_close = false;
        self.inner.build_connection();
    }

    /// Close the connection deliberately and suppress reconnection until the next
    /// [`start`](Self::start).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Send a text frame. Returns `false` unless connected and the session accepted it.
    ///
    /// A session that refuses the frame is treated like a transport failure and
    /// schedules a reconnect.
    pub fn send_text<S: Into<String>>(&self, text: S) -> bool {
        let text = text.into();
        self.inner.send(|session| session.send_text(text))
    }

    /// Send a binary frame. Same contract as [`send_text`](Self::send_text).
    pub fn send_binary<B: Into<Bytes>>(&self, bytes: B) -> bool {
        let bytes = bytes.into();
        self.inner.send(|session| session.send_binary(bytes))
    }

    /// Serialize `request` as JSON and send it as a text frame.
    ///
    /// A serialization failure is returned as an error and never reaches the session.
    pub fn send_json<R: Serialize>(&self, request: &R) -> Result<bool> {
        let json = serde_json::to_string(request)?;
        Ok(self.send_text(json))
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().status
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of reconnects scheduled since the last successful open or [`stop`](Self::stop).
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().backoff.attempt()
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Subscribe to incoming messages.
    ///
    /// Messages are published from the main execution context, in arrival order.
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_status(&self, state: &mut State, status: ConnectionState) {
        if state.status != status {
            #[cfg(feature = "tracing")]
            tracing::debug!(from = ?state.status, to = ?status, "Connection state changed");
            state.status = status;
        }
        self.state_tx.send_replace(status);
    }

    fn build_connection(self: &Arc<Self>) {
        let reachable = self.reachability.is_reachable();

        let epoch = {
            let mut state = self.state.lock();
            match state.status {
                ConnectionState::Connected | ConnectionState::Connecting => return,
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }

            if !reachable {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %self.endpoint, "Network unreachable, not connecting");
                self.set_status(&mut state, ConnectionState::Disconnected);
                return;
            }

            // A reconnect timer still pending here has been overtaken by `start`
            if let Some(pending) = state.pending_reconnect.take() {
                pending.cancel();
            }
            state.timer_generation = state.timer_generation.wrapping_add(1);

            self.set_status(&mut state, ConnectionState::Connecting);
            state.epoch
        };

        self.initiate_session(epoch);
    }

    fn initiate_session(self: &Arc<Self>, epoch: u64) {
        self.transport.cancel_all();

        let Some(_creation) = self.session_lock.try_lock_for(self.session_lock_timeout) else {
            let error = Error::synchronization(self.session_lock_timeout);
            #[cfg(feature = "tracing")]
            tracing::error!("Abandoning session creation: {error}");
            #[cfg(not(feature = "tracing"))]
            let _ = &error;
            self.abandon(epoch);
            return;
        };

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.status != ConnectionState::Connecting {
                #[cfg(feature = "tracing")]
                tracing::debug!(session = id, "Session creation overtaken, abandoning");
                return;
            }

            if let Some(previous) = state.session.take()
                && let Some(handle) = previous.handle
            {
                handle.close(NORMAL_CLOSURE.code, NORMAL_CLOSURE.reason);
            }
            state.session = Some(ActiveSession {
                id,
                handle: None,
                opened: false,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(session = id, endpoint = %self.endpoint, "Opening session");

        let events = SessionEvents {
            id,
            manager: Arc::downgrade(self),
        };
        let handle = self.transport.open(&self.endpoint, events);

        let mut state = self.state.lock();
        let still_current =
            state.epoch == epoch && state.session.as_ref().is_some_and(|active| active.id == id);
        if still_current && let Some(active) = state.session.as_mut() {
            active.handle = Some(handle);
        } else {
            drop(state);
            #[cfg(feature = "tracing")]
            tracing::debug!(session = id, "Session superseded while opening, closing it");
            handle.close(NORMAL_CLOSURE.code, NORMAL_CLOSURE.reason);
        }
    }

    fn abandon(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.status == ConnectionState::Connecting {
            self.set_status(&mut state, ConnectionState::Disconnected);
        }
    }

    /// Reacts to `trigger` from session `id`. Returns `false`, changing nothing, when
    /// that session is no longer the current one.
    fn attempt_reconnect(self: &Arc<Self>, id: u64, trigger: Trigger) -> bool {
        let reachable = self.reachability.is_reachable();

        let (delay, generation) = {
            let mut state = self.state.lock();
            let current = state.session.as_ref().is_some_and(|active| active.id == id);
            let applies = match trigger {
                Trigger::Failed => current,
                Trigger::RefusedFrame => current && state.status == ConnectionState::Connected,
            };
            if !applies {
                #[cfg(feature = "tracing")]
                tracing::debug!(session = id, ?trigger, "Ignoring failure from superseded session");
                return false;
            }

            if !self.reconnect || state.manual_close {
                self.set_status(&mut state, ConnectionState::Disconnected);
                return true;
            }
            if !reachable {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %self.endpoint, "Network unreachable, not reconnecting");
                self.set_status(&mut state, ConnectionState::Disconnected);
                return true;
            }

            self.set_status(&mut state, ConnectionState::Reconnecting);
            let delay = state.backoff.next_backoff().unwrap_or_default();
            if let Some(previous) = state.pending_reconnect.take() {
                previous.cancel();
            }
            state.timer_generation = state.timer_generation.wrapping_add(1);

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt = state.backoff.attempt(), ?delay, "Scheduling reconnect");

            (delay, state.timer_generation)
        };

        let manager = Arc::downgrade(self);
        let scheduled = self.background_context.post_delayed(
            delay,
            Box::new(move || {
                if let Some(inner) = manager.upgrade() {
                    inner.reconnect_fired(generation);
                }
            }),
        );

        let mut state = self.state.lock();
        if state.timer_generation == generation {
            state.pending_reconnect = Some(scheduled);
        } else {
            scheduled.cancel();
        }
        true
    }

    fn reconnect_fired(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.timer_generation != generation
                || state.manual_close
                || state.status != ConnectionState::Reconnecting
            {
                return;
            }
            state.pending_reconnect = None;
        }

        self.listener.on_reconnecting();
        self.build_connection();
    }

    fn cancel_reconnect(state: &mut State) {
        if let Some(pending) = state.pending_reconnect.take() {
            pending.cancel();
        }
        state.timer_generation = state.timer_generation.wrapping_add(1);
        state.backoff.reset();
    }

    fn stop(&self) {
        let notify = {
            let mut state = self.state.lock();
            state.manual_close = true;
            Self::cancel_reconnect(&mut state);
            if state.status == ConnectionState::Disconnected {
                // A failed session can linger here after the network went away
                if let Some(handle) = state.session.take().and_then(|active| active.handle) {
                    handle.close(NORMAL_CLOSURE.code, NORMAL_CLOSURE.reason);
                }
                return;
            }

            state.epoch = state.epoch.wrapping_add(1);
            // Only a session that reported `opened` has a close worth announcing
            let notify = match state.session.take() {
                Some(ActiveSession {
                    handle: Some(handle),
                    opened,
                    ..
                }) => handle.close(NORMAL_CLOSURE.code, NORMAL_CLOSURE.reason) && opened,
                _ => false,
            };
            self.set_status(&mut state, ConnectionState::Disconnected);
            notify
        };

        if notify {
            let signal = if self.legacy_close_notification {
                ABNORMAL_CLOSURE
            } else {
                NORMAL_CLOSURE
            };
            self.listener.on_closed(signal.code, signal.reason);
        }
    }

    fn send<F: FnOnce(&dyn Session) -> bool>(self: &Arc<Self>, send: F) -> bool {
        let (id, session) = {
            let state = self.state.lock();
            if state.status != ConnectionState::Connected {
                return false;
            }
            match state.session.as_ref() {
                Some(ActiveSession {
                    id,
                    handle: Some(handle),
                    ..
                }) => (*id, Arc::clone(handle)),
                _ => return false,
            }
        };

        if send(session.as_ref()) {
            true
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(session = id, "Session refused outgoing frame, reconnecting");
            self.attempt_reconnect(id, Trigger::RefusedFrame);
            false
        }
    }

    fn is_current(&self, id: u64) -> bool {
        let current = self
            .state
            .lock()
            .session
            .as_ref()
            .is_some_and(|active| active.id == id);

        if !current {
            #[cfg(feature = "tracing")]
            tracing::debug!(session = id, "Ignoring event from superseded session");
        }

        current
    }

    fn on_opened(&self, id: u64, response: HandshakeResponse) {
        {
            let mut state = self.state.lock();
            match state.session.as_mut() {
                Some(active) if active.id == id => active.opened = true,
                _ => return,
            }
            self.set_status(&mut state, ConnectionState::Connected);
            Self::cancel_reconnect(&mut state);
        }

        self.listener.on_open(&response);
    }

    fn on_text_message(&self, id: u64, text: String) {
        if !self.is_current(id) {
            return;
        }

        let broadcast_tx = self.broadcast_tx.clone();
        let message = Message::Text(text.clone());
        self.main_context.post(Box::new(move || {
            _ = broadcast_tx.send(message);
        }));
        self.listener.on_text_message(&text);
    }

    fn on_binary_message(&self, id: u64, bytes: Bytes) {
        if !self.is_current(id) {
            return;
        }

        let broadcast_tx = self.broadcast_tx.clone();
        let message = Message::Binary(bytes.clone());
        self.main_context.post(Box::new(move || {
            _ = broadcast_tx.send(message);
        }));
        self.listener.on_binary_message(&bytes);
    }

    fn on_closing(&self, id: u64, code: u16, reason: &str) {
        if self.is_current(id) {
            self.listener.on_closing(code, reason);
        }
    }

    fn on_closed(&self, id: u64, code: u16, reason: &str) {
        if self.is_current(id) {
            self.transport.cancel_all();
            self.listener.on_closed(code, reason);
        }
    }

    fn on_failed(self: &Arc<Self>, id: u64, error: &Error, response: Option<&HandshakeResponse>) {
        if !self.attempt_reconnect(id, Trigger::Failed) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(session = id, "Session failed: {error}");

        self.listener.on_failure(error, response);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(pending) = state.pending_reconnect.take() {
            pending.cancel();
        }
        if let Some(handle) = state.session.take().and_then(|active| active.handle) {
            handle.close(NORMAL_CLOSURE.code, NORMAL_CLOSURE.reason);
        }
    }
}

/// Event sink handed to a [`Transport`] for one session.
///
/// Each method maps one transport callback onto the owning manager. Events from a
/// session that has since been replaced or stopped, or whose manager has been
/// dropped, are ignored.
#[derive(Clone)]
pub struct SessionEvents {
    id: u64,
    manager: Weak<Inner>,
}

impl SessionEvents {
    /// Session identifier, unique per manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The opening handshake completed.
    pub fn opened(&self, response: HandshakeResponse) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_opened(self.id, response);
        }
    }

    pub fn text_message(&self, text: String) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_text_message(self.id, text);
        }
    }

    pub fn binary_message(&self, bytes: Bytes) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_binary_message(self.id, bytes);
        }
    }

    /// The peer sent a close frame.
    pub fn closing(&self, code: u16, reason: String) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_closing(self.id, code, &reason);
        }
    }

    /// The close handshake finished and the session is gone.
    pub fn closed(&self, code: u16, reason: String) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_closed(self.id, code, &reason);
        }
    }

    /// The handshake failed or the session broke; `response` is set when the server
    /// rejected the upgrade.
    pub fn failed(&self, error: Error, response: Option<HandshakeResponse>) {
        if let Some(inner) = self.manager.upgrade() {
            inner.on_failed(self.id, &error, response.as_ref());
        }
    }
}

impl fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEvents")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
