//! Application-wide constants for wsrelay.
//!
//! This module centralizes every default limit and timeout. The values here
//! seed [`crate::config::Config`]; once a configuration is loaded at startup
//! it is immutable and applies uniformly to every connection.
//!
//! # Categories
//!
//! - **Limits**: Queue and payload bounds
//! - **Timeouts**: Connect, idle, and handshake deadlines
//! - **Backpressure**: Buffer water marks and resume cooldown
//! - **Close codes**: WebSocket status codes sent on termination

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Limits
// ============================================================================

/// Maximum number of payloads held for one connection before it is closed
/// with "queue overflow".
///
/// Applies to the pending queue while the TCP connect is in flight, and to
/// the write backlog accumulated while the TCP send buffer is saturated.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Maximum size of a single inbound WebSocket message (100 KiB).
pub const MAX_PAYLOAD_LENGTH: usize = 100 * 1024;

/// Maximum number of simultaneously relayed sessions.
pub const MAX_CONNECTIONS: usize = 1024;

/// Maximum size of an HTTP request head accepted before the upgrade.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// TCP read buffer size per session.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// Deadline for establishing the TCP connection to the target.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inactivity window after which a relayed session is closed.
///
/// Any frame or TCP chunk in either direction counts as activity.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for receiving a complete HTTP request head from a new client.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closing WebSocket writer may spend flushing its close frame.
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Delay before restarting the helper process after it exits.
pub const HELPER_RESTART_DELAY: Duration = Duration::from_secs(5);

/// How long the helper's output forwarders may keep reading after it exits.
///
/// Pipes inherited by a background grandchild stay open; the supervisor
/// stops forwarding after this grace instead of waiting for them.
pub const HELPER_OUTPUT_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Backpressure
// ============================================================================

/// Fallback delay before re-checking the WebSocket buffer after pausing TCP reads.
///
/// Reads normally resume on an explicit drain notification from the
/// WebSocket writer; the cooldown only covers a missed notification.
pub const BACKPRESSURE_COOLDOWN: Duration = Duration::from_millis(100);

/// Buffered TCP bytes at which the stream stops being writable.
pub const STREAM_HIGH_WATER: usize = 64 * 1024;

/// Buffered TCP bytes at which a saturated stream reports drain.
pub const STREAM_LOW_WATER: usize = 16 * 1024;

/// Buffered WebSocket bytes at which TCP reads are paused.
pub const FRAME_HIGH_WATER: usize = 256 * 1024;

/// Buffered WebSocket bytes at which a saturated session reports drain.
pub const FRAME_LOW_WATER: usize = 64 * 1024;

// ============================================================================
// Server
// ============================================================================

/// Default listen address (all interfaces, port 8080).
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Default fixed relay target.
pub const DEFAULT_TARGET: &str = "app:3333";

/// Body of the plain-text status response.
pub const STATUS_TEXT: &str = "running\n";

// ============================================================================
// WebSocket close codes
// ============================================================================

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Policy violation (invalid or forbidden target).
pub const CLOSE_POLICY: u16 = 1008;

/// Message too big.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Internal error (TCP failures, protocol violations).
pub const CLOSE_INTERNAL: u16 = 1011;

/// Try again later (queue overflow).
pub const CLOSE_TRY_AGAIN: u16 = 1013;
