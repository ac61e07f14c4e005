//! Value types shared between the connection manager, transports and listeners.

use bytes::Bytes;
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};

/// A close status code paired with its reason phrase.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

/// Sent to the server when the session is closed deliberately.
pub const NORMAL_CLOSURE: CloseReason = CloseReason {
    code: 1000,
    reason: "normal close",
};

/// Reported to the listener after a deliberate close when
/// `legacy_close_notification` is enabled.
pub const ABNORMAL_CLOSURE: CloseReason = CloseReason {
    code: 1001,
    reason: "abnormal close",
};

/// Inbound message published to [`subscribe`](super::ConnectionManager::subscribe) receivers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            Self::Text(_) => None,
        }
    }
}

/// HTTP response observed during the opening handshake.
///
/// Delivered with `on_open` after a successful upgrade, and with `on_failure`
/// when the server answered the upgrade request with something other than `101`.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers in arrival order; values that are not valid UTF-8 are dropped
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn from_parts(status: StatusCode, headers: &HeaderMap) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();

        Self {
            status: status.as_u16(),
            headers,
        }
    }
}
