//! Capabilities the connection manager consumes from its environment.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::SessionEvents;
use super::types::HandshakeResponse;
use crate::error::Error;

/// Unit of work handed to an [`ExecutionContext`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receives connection notifications.
///
/// Every method has a no-op default, so implementors only override what they need.
/// Callbacks run on the transport's thread (or the caller's thread for `stop`) and
/// must not block.
pub trait Listener: Send + Sync + 'static {
    fn on_open(&self, _response: &HandshakeResponse) {}

    fn on_text_message(&self, _text: &str) {}

    fn on_binary_message(&self, _bytes: &Bytes) {}

    /// A scheduled reconnect fired and a new session is about to be requested.
    fn on_reconnecting(&self) {}

    fn on_closing(&self, _code: u16, _reason: &str) {}

    fn on_closed(&self, _code: u16, _reason: &str) {}

    fn on_failure(&self, _error: &Error, _response: Option<&HandshakeResponse>) {}
}

/// [`Listener`] used when none is configured.
#[non_exhaustive]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl Listener for NoopListener {}

/// Reports whether the network is currently usable.
///
/// Queried before every connection attempt, without any manager lock held, so an
/// implementation may call back into the manager.
pub trait Reachability: Send + Sync + 'static {
    fn is_reachable(&self) -> bool;
}

impl<F> Reachability for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_reachable(&self) -> bool {
        self()
    }
}

/// Somewhere tasks can be posted, immediately or after a delay.
///
/// The manager uses one context to hand inbound messages to consumers and a
/// second one to run reconnect timers. Whether a context is a single thread or a
/// pool is up to the implementation.
pub trait ExecutionContext: Send + Sync + 'static {
    fn post(&self, task: Task);

    /// Runs `task` after `delay` unless the returned handle is cancelled first.
    fn post_delayed(&self, delay: Duration, task: Task) -> ScheduledTask;
}

/// Cancellable handle to a task posted with [`ExecutionContext::post_delayed`].
///
/// Cancelling is idempotent and safe after the task has already run.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that is cancelled together with this handle.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Opens transport sessions. Handshake, framing and TLS live behind this trait.
pub trait Transport: Send + Sync + 'static {
    /// Starts opening a session to `endpoint` and returns its handle immediately.
    ///
    /// The outcome of the handshake, and everything after it, is reported
    /// through `events`.
    fn open(&self, endpoint: &Url, events: SessionEvents) -> Arc<dyn Session>;

    /// Aborts every in-flight handshake and session opened by this transport
    /// without reporting further events for them.
    fn cancel_all(&self);
}

/// One live connection produced by a [`Transport`].
///
/// [`close`](Self::close) is called with the manager's state lock held and must not
/// report events through [`SessionEvents`] synchronously. The send methods are called
/// without any manager lock held.
pub trait Session: Send + Sync + 'static {
    /// Queues a text frame. Returns `false` if the session can no longer send.
    fn send_text(&self, text: String) -> bool;

    /// Queues a binary frame. Returns `false` if the session can no longer send.
    fn send_binary(&self, bytes: Bytes) -> bool;

    /// Starts a graceful close. Returns `false` if the session was already
    /// closing or closed.
    fn close(&self, code: u16, reason: &str) -> bool;
}
