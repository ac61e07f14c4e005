//! Default [`Transport`] built on `tokio-tungstenite`.

#![expect(
    clippy::module_name_repetitions,
    reason = "TransportConfig mirrors the module name for clarity"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WireMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::SessionEvents;
use super::error::WsError;
use super::traits::{Session, Transport};
use super::types::HandshakeResponse;
use crate::Result;
use crate::error::Error;

const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(3);

/// Close code reported when the peer's close frame carried no status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Configuration for [`TungsteniteTransport`].
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct TransportConfig {
    /// Upper bound on TCP connect, TLS and the HTTP upgrade combined.
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT_DURATION)]
    pub handshake_timeout: Duration,
    /// Dial once more, immediately, when the connect itself fails with an I/O error.
    #[builder(default = true)]
    pub retry_on_connection_failure: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

enum Command {
    Text(String),
    Binary(Bytes),
    Close(CloseFrame),
}

/// Opens each session as a task on a tokio runtime.
///
/// Every session task watches a child of the transport's root cancellation token;
/// [`cancel_all`](Transport::cancel_all) swaps the root out and cancels the old one.
#[derive(Debug)]
pub struct TungsteniteTransport {
    config: TransportConfig,
    handle: Handle,
    root: Mutex<CancellationToken>,
}

impl TungsteniteTransport {
    /// Creates a transport on the runtime the caller is running in.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            Error::validation(format!("TungsteniteTransport requires a tokio runtime: {e}"))
        })?;
        Ok(Self::with_handle(config, handle))
    }

    #[must_use]
    pub fn with_handle(config: TransportConfig, handle: Handle) -> Self {
        Self {
            config,
            handle,
            root: Mutex::new(CancellationToken::new()),
        }
    }
}

impl Transport for TungsteniteTransport {
    fn open(&self, endpoint: &Url, events: SessionEvents) -> Arc<dyn Session> {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = self.root.lock().child_token();

        self.handle.spawn(run_session(
            endpoint.to_string(),
            self.config.clone(),
            events,
            rx,
            cancel,
        ));

        Arc::new(TungsteniteSession {
            commands,
            closing: AtomicBool::new(false),
        })
    }

    fn cancel_all(&self) {
        let previous = std::mem::take(&mut *self.root.lock());
        previous.cancel();
    }
}

impl Drop for TungsteniteTransport {
    fn drop(&mut self) {
        self.root.get_mut().cancel();
    }
}

/// Handle to a session task. Frames are queued and written by the task in order.
#[derive(Debug)]
struct TungsteniteSession {
    commands: mpsc::UnboundedSender<Command>,
    closing: AtomicBool,
}

impl Session for TungsteniteSession {
    fn send_text(&self, text: String) -> bool {
        !self.closing.load(Ordering::Acquire) && self.commands.send(Command::Text(text)).is_ok()
    }

    fn send_binary(&self, bytes: Bytes) -> bool {
        !self.closing.load(Ordering::Acquire) && self.commands.send(Command::Binary(bytes)).is_ok()
    }

    fn close(&self, code: u16, reason: &str) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.commands.send(Command::Close(frame)).is_ok()
    }
}

async fn run_session(
    endpoint: String,
    config: TransportConfig,
    events: SessionEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let dial = async {
        match connect_async(endpoint.as_str()).await {
            Err(tungstenite::Error::Io(_)) if config.retry_on_connection_failure => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%endpoint, "Connect failed, dialing once more");
                connect_async(endpoint.as_str()).await
            }
            other => other,
        }
    };

    let handshake = tokio::select! {
        () = cancel.cancelled() => return,
        result = timeout(config.handshake_timeout, dial) => result,
    };

    let (ws_stream, response) = match handshake {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            let response = match &e {
                tungstenite::Error::Http(response) => Some(HandshakeResponse::from_parts(
                    response.status(),
                    response.headers(),
                )),
                _ => None,
            };
            events.failed(e.into(), response);
            return;
        }
        Err(_elapsed) => {
            events.failed(WsError::HandshakeTimeout(config.handshake_timeout).into(), None);
            return;
        }
    };

    events.opened(HandshakeResponse::from_parts(
        response.status(),
        response.headers(),
    ));

    let (mut write, mut read) = ws_stream.split();
    // Status and reason from the peer's close frame, once one has arrived.
    let mut peer_close: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,

            // Outgoing frames queued through the session handle
            command = commands.recv() => {
                let message = match command {
                    Some(Command::Text(text)) => WireMessage::Text(text.into()),
                    Some(Command::Binary(bytes)) => WireMessage::Binary(bytes),
                    Some(Command::Close(frame)) => WireMessage::Close(Some(frame)),
                    // Session handle dropped by its owner
                    None => return,
                };

                #[cfg(feature = "tracing")]
                tracing::trace!(?message, "Sending WebSocket frame");

                if let Err(e) = write.send(message).await {
                    events.failed(e.into(), None);
                    return;
                }
            }

            // Incoming frames
            message = read.next() => {
                match message {
                    Some(Ok(WireMessage::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");
                        events.text_message(text.to_string());
                    }
                    Some(Ok(WireMessage::Binary(bytes))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(len = bytes.len(), "Received WebSocket binary message");
                        events.binary_message(bytes);
                    }
                    Some(Ok(WireMessage::Close(frame))) => {
                        let (code, reason) = frame.map_or_else(
                            || (NO_STATUS_RECEIVED, String::new()),
                            |frame| (u16::from(frame.code), frame.reason.to_string()),
                        );
                        events.closing(code, reason.clone());
                        peer_close = Some((code, reason));
                    }
                    Some(Ok(_)) => {
                        // Ping and pong are answered by tungstenite itself.
                    }
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                    | None => {
                        match peer_close.take() {
                            Some((code, reason)) => events.closed(code, reason),
                            None => events.failed(WsError::ConnectionClosed.into(), None),
                        }
                        return;
                    }
                    Some(Err(e)) => {
                        events.failed(e.into(), None);
                        return;
                    }
                }
            }
        }
    }
}
