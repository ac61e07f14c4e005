//! Keeps a connection to a WebSocket endpoint alive and logs everything it receives.
//!
//! Kill and restart the server while this runs to watch the manager back off and
//! reconnect.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example reconnecting --features tracing -- ws://127.0.0.1:9001
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=reconnecting.log RUST_LOG=debug cargo run --example reconnecting --features tracing -- ws://127.0.0.1:9001
//! ```

use std::fs::File;
use std::sync::Arc;

use resilient_ws::error::Error;
use resilient_ws::ws::config::Config;
use resilient_ws::ws::executor::TokioContext;
use resilient_ws::ws::{ConnectionManager, HandshakeResponse, Listener, Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:9001";

struct LoggingListener;

impl Listener for LoggingListener {
    fn on_open(&self, response: &HandshakeResponse) {
        info!(status = response.status, "connected");
    }

    fn on_reconnecting(&self) {
        info!("reconnecting");
    }

    fn on_closed(&self, code: u16, reason: &str) {
        info!(code, reason, "closed");
    }

    fn on_failure(&self, error: &Error, response: Option<&HandshakeResponse>) {
        warn!(error = %error, status = ?response.map(|r| r.status), "connection failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());

    let context = Arc::new(TokioContext::new()?);
    let connection = ConnectionManager::new(
        Config::builder()
            .endpoint(endpoint)
            .main_context(context.clone())
            .background_context(context)
            .listener(Arc::new(LoggingListener))
            .build(),
    )?;

    let mut messages = connection.subscribe();
    connection.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => match message {
                Ok(Message::Text(text)) => info!(%text, "text message"),
                Ok(Message::Binary(bytes)) => info!(len = bytes.len(), "binary message"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "message stream lagged or closed"),
            },
        }
    }

    connection.stop();
    info!(attempts = connection.reconnect_attempts(), state = ?connection.state(), "stopped");

    Ok(())
}
