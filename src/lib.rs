//! wsrelay - WebSocket to TCP line relay.
//!
//! Each accepted WebSocket session is bridged to exactly one TCP connection.
//! Inbound messages become newline-terminated lines on the TCP side; TCP
//! bytes go back out as messages, unmodified.
//!
//! # Architecture
//!
//! - **Relay** - Sans-I/O per-connection state machine (queueing,
//!   backpressure, lifecycle)
//! - **Server** - Tokio accept loop, status page, WebSocket sessions
//! - **Target** - Fixed or path-encoded TCP endpoint resolution
//! - **Supervisor** - Optional companion process kept running
//!
//! # Modules
//!
//! - [`relay`] - Connection state machine and transport traits
//! - [`server`] - Listener and per-session driver
//! - [`target`] - Target parsing, decoding, and block lists
//! - [`config`] - Configuration loading and validation
//! - [`supervisor`] - Helper process supervision

// Library modules
pub mod config;
pub mod constants;
pub mod relay;
pub mod server;
pub mod supervisor;
pub mod target;

// Re-export commonly used types
pub use config::{Config, HelperConfig, RelayLimits};
pub use relay::{ByteStream, CloseReason, Connection, ConnectionId, FrameTransport, Phase, Termination};
pub use server::RelayServer;
pub use supervisor::{HelperEvent, Supervisor};
pub use target::{Target, TargetError, TargetPolicy, TargetResolver};

/// Crate version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
