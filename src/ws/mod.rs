//! Resilient WebSocket connection management.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: state machine owning one transport session, with linear-backoff
//!   reconnection and a single-outstanding-session discipline
//! - [`Transport`] / [`Session`]: the socket capability; [`transport::TungsteniteTransport`]
//!   is the default
//! - [`ExecutionContext`]: where inbound messages are delivered and reconnect timers run;
//!   [`executor::TokioContext`] is the default
//! - [`Listener`]: connection notifications
//!
//! # Example
//!
//! ```ignore
//! let context = Arc::new(TokioContext::new()?);
//! let connection = ConnectionManager::new(
//!     Config::builder()
//!         .endpoint("wss://stream.example.com/ws")
//!         .main_context(context.clone())
//!         .background_context(context)
//!         .listener(Arc::new(MyListener))
//!         .build(),
//! )?;
//! connection.start();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod traits;
pub mod transport;
pub mod types;

pub use connection::{ConnectionManager, ConnectionState, SessionEvents};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
pub use types::{ABNORMAL_CLOSURE, CloseReason, HandshakeResponse, Message, NORMAL_CLOSURE};
