#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;

use super::traits::{ExecutionContext, Listener, Reachability, Transport};

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_SESSION_LOCK_TIMEOUT_DURATION: Duration = Duration::from_secs(3);

/// Configuration for a [`ConnectionManager`](super::ConnectionManager), fixed at construction.
///
/// # Example
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use resilient_ws::ws::config::Config;
/// use resilient_ws::ws::executor::TokioContext;
///
/// # fn main() -> resilient_ws::Result<()> {
/// let context = Arc::new(TokioContext::new()?);
/// let config = Config::builder()
///     .endpoint("wss://stream.example.com/ws")
///     .main_context(context.clone())
///     .background_context(context)
///     .build();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Builder)]
pub struct Config {
    /// `ws://` or `wss://` URL of the server endpoint.
    #[builder(into)]
    pub(crate) endpoint: String,
    /// Whether failures schedule a reconnect. Defaults to `true`.
    #[builder(default = true)]
    pub(crate) reconnect: bool,
    /// Spacing of reconnect attempts.
    #[builder(default)]
    pub(crate) reconnect_policy: ReconnectConfig,
    /// Transport used to open sessions. Defaults to a
    /// [`TungsteniteTransport`](super::transport::TungsteniteTransport) with its default config.
    pub(crate) transport: Option<Arc<dyn Transport>>,
    /// Context that receives inbound messages on behalf of consumers.
    pub(crate) main_context: Arc<dyn ExecutionContext>,
    /// Context that runs reconnect timers.
    pub(crate) background_context: Arc<dyn ExecutionContext>,
    pub(crate) listener: Option<Arc<dyn Listener>>,
    /// Network availability check. Defaults to always reachable.
    pub(crate) reachability: Option<Arc<dyn Reachability>>,
    /// Upper bound on waiting for a competing session creation to finish.
    #[builder(default = DEFAULT_SESSION_LOCK_TIMEOUT_DURATION)]
    pub(crate) session_lock_timeout: Duration,
    /// Report a successful `stop()` as [`ABNORMAL_CLOSURE`](super::types::ABNORMAL_CLOSURE)
    /// instead of [`NORMAL_CLOSURE`](super::types::NORMAL_CLOSURE).
    #[builder(default)]
    pub(crate) legacy_close_notification: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("reconnect", &self.reconnect)
            .field("reconnect_policy", &self.reconnect_policy)
            .field("custom_transport", &self.transport.is_some())
            .field("listener", &self.listener.is_some())
            .field("reachability", &self.reachability.is_some())
            .field("session_lock_timeout", &self.session_lock_timeout)
            .field("legacy_close_notification", &self.legacy_close_notification)
            .finish_non_exhaustive()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay added per failed attempt
    pub interval: Duration,
    /// Maximum delay between attempts
    pub max_interval: Duration,
}

impl ReconnectConfig {
    #[must_use]
    pub fn new(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
            max_interval: DEFAULT_MAX_RECONNECT_INTERVAL_DURATION,
        }
    }
}

/// Linear backoff: the n-th delay (counting from zero) is `min(n * interval, max_interval)`.
///
/// The first delay is therefore zero and the attempt counter doubles as the
/// manager's reconnect-attempt count.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    attempt: u32,
    interval: Duration,
    max_interval: Duration,
}

impl LinearBackoff {
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for LinearBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self
            .interval
            .saturating_mul(self.attempt)
            .min(self.max_interval);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl From<ReconnectConfig> for LinearBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            interval: config.interval,
            max_interval: config.max_interval,
        }
    }
}
