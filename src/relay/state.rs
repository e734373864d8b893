//! Per-connection state owned by the relay core.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::lifecycle::Termination;
use super::queue::PendingQueue;
use super::transport::ByteStream;
use crate::config::RelayLimits;
use crate::target::Target;

/// Global counter for session IDs.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier attached to every log record for one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a process-unique ID: a sequence number plus a random suffix.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix: u16 = rand::random();
        Self(format!("ws-{seq}-{suffix:04x}"))
    }

    /// Borrow the ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of a connection.
///
/// Transitions only move forward:
///
/// ```text
/// Connecting ──► Active ──► Closing ──► Closed
///      │                       ▲
///      └───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// TCP connect in flight; inbound frames are queued.
    Connecting,
    /// Both sides open; data flows directly.
    Active,
    /// Teardown in progress.
    Closing,
    /// Terminal. No further effects.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Traffic counters for one connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Frames accepted from the WebSocket peer.
    pub frames_received: u64,
    /// Lines written to the TCP stream.
    pub lines_written: u64,
    /// Bytes written to the TCP stream.
    pub bytes_to_stream: u64,
    /// Chunks read from the TCP stream and forwarded as frames.
    pub frames_sent: u64,
    /// Bytes forwarded to the WebSocket peer.
    pub bytes_to_frames: u64,
}

/// Relay state for one WebSocket session and its TCP stream.
///
/// Created once per accepted session with a resolved [`Target`]. All
/// inputs arrive as `on_*` events; all effects go out through the
/// transport traits passed into each call. Once [`Phase::Closed`] is
/// reached every event is ignored.
pub struct Connection {
    pub(super) id: ConnectionId,
    pub(super) target: Target,
    pub(super) limits: RelayLimits,
    pub(super) phase: Phase,
    pub(super) pending: PendingQueue,

    /// Stream accepts writes without saturating.
    pub(super) stream_writable: bool,
    /// Frame buffer below the high-water mark.
    pub(super) frame_writable: bool,
    /// Connect issued but not yet resolved.
    pub(super) connect_pending: bool,
    /// Stream is established and owned by this connection.
    pub(super) stream_attached: bool,
    /// WebSocket still open from our side.
    pub(super) frame_open: bool,
    pub(super) deadline_armed: bool,
    pub(super) stream_read_paused: bool,
    pub(super) frame_read_paused: bool,

    /// Lines written while the stream was saturated.
    pub(super) backlog: usize,
    pub(super) stats: RelayStats,
    pub(super) opened_at: Instant,
    pub(super) termination: Option<Termination>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("phase", &self.phase)
            .field("queued", &self.pending.len())
            .field("backlog", &self.backlog)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create the connection and immediately start the TCP connect.
    ///
    /// Issues exactly one [`ByteStream::connect`], which also arms the
    /// connect deadline.
    pub fn open<S: ByteStream>(id: ConnectionId, target: Target, limits: RelayLimits, io: &mut S) -> Self {
        log::info!("[Relay] {} connecting to {}", id, target);
        io.connect(&target, limits.connect_timeout);

        Self {
            id,
            target,
            limits,
            phase: Phase::Connecting,
            pending: PendingQueue::new(limits.max_queue_size),
            stream_writable: false,
            frame_writable: true,
            connect_pending: true,
            stream_attached: false,
            frame_open: true,
            deadline_armed: true,
            stream_read_paused: false,
            frame_read_paused: false,
            backlog: 0,
            stats: RelayStats::default(),
            opened_at: Instant::now(),
            termination: None,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// TCP endpoint this session relays to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Lines waiting for the TCP connect.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Lines written since the stream last reported drain.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Whether the stream currently accepts writes without saturating.
    pub fn is_stream_writable(&self) -> bool {
        self.stream_writable
    }

    /// Whether the frame buffer is below its high-water mark.
    pub fn is_frame_writable(&self) -> bool {
        self.frame_writable
    }

    /// Whether TCP reads are paused for backpressure.
    pub fn is_stream_read_paused(&self) -> bool {
        self.stream_read_paused
    }

    /// Whether inbound frames are paused for backpressure.
    pub fn is_frame_read_paused(&self) -> bool {
        self.frame_read_paused
    }

    /// Traffic counters.
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// How the connection ended, once it has.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub(super) fn pause_frame_intake<F: super::FrameTransport>(&mut self, io: &mut F) {
        if !self.frame_read_paused {
            self.frame_read_paused = true;
            io.pause_frames();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ws-"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Connecting.to_string(), "connecting");
        assert_eq!(Phase::Closed.to_string(), "closed");
    }
}
