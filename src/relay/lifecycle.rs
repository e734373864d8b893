//! Connection teardown.
//!
//! Every path out of a session funnels through [`Connection::terminate`],
//! which releases both transports in a fixed order and records exactly one
//! [`Termination`]. A second call is a no-op, so racing close events from
//! the two sides are harmless.

use std::fmt;
use std::time::Duration;

use super::state::{Connection, Phase, RelayStats};
use super::transport::{ByteStream, FrameTransport};
use crate::constants::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_POLICY, CLOSE_TOO_BIG, CLOSE_TRY_AGAIN,
};

/// Why a connection was terminated.
///
/// Each reason maps to the WebSocket close code and reason text sent to the
/// peer. Peer-initiated reasons ([`FrameClosed`](Self::FrameClosed),
/// [`FrameError`](Self::FrameError)) send nothing, since the session is
/// already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// TCP peer closed the stream.
    StreamClosed,
    /// TCP stream reported an error.
    StreamError,
    /// TCP connect did not finish before the deadline.
    ConnectTimeout,
    /// TCP connect was refused or failed to resolve.
    ConnectFailed,
    /// Pending queue or write backlog exceeded its bound.
    QueueOverflow,
    /// Data arrived for a stream that is not active.
    NotReady,
    /// No traffic in either direction for the idle window.
    IdleTimeout,
    /// Inbound message exceeded the payload limit.
    PayloadTooLarge,
    /// WebSocket peer closed the session.
    FrameClosed,
    /// WebSocket session reported an error.
    FrameError,
    /// The server is shutting down.
    Shutdown,
    /// Request path did not carry a usable target.
    InvalidAddress,
    /// Target is on the block list.
    ForbiddenTarget,
}

impl CloseReason {
    /// WebSocket close code for this reason.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::StreamClosed | Self::IdleTimeout | Self::FrameClosed => CLOSE_NORMAL,
            Self::Shutdown => CLOSE_GOING_AWAY,
            Self::InvalidAddress | Self::ForbiddenTarget => CLOSE_POLICY,
            Self::PayloadTooLarge => CLOSE_TOO_BIG,
            Self::QueueOverflow => CLOSE_TRY_AGAIN,
            Self::StreamError | Self::ConnectTimeout | Self::ConnectFailed | Self::NotReady | Self::FrameError => {
                CLOSE_INTERNAL
            }
        }
    }

    /// Close reason text sent to the peer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamClosed => "TCP closed",
            Self::StreamError => "TCP error",
            Self::ConnectTimeout => "TCP connect timeout",
            Self::ConnectFailed => "TCP connect failed",
            Self::QueueOverflow => "queue overflow",
            Self::NotReady => "transport not ready",
            Self::IdleTimeout => "idle timeout",
            Self::PayloadTooLarge => "payload too large",
            Self::FrameClosed => "WS closed",
            Self::FrameError => "WS error",
            Self::Shutdown => "server shutting down",
            Self::InvalidAddress => "invalid address",
            Self::ForbiddenTarget => "forbidden target",
        }
    }

    /// Whether this reason indicates something went wrong.
    ///
    /// Failures are logged at `warn`, orderly closes at `info`.
    #[must_use]
    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            Self::StreamClosed | Self::IdleTimeout | Self::FrameClosed | Self::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of how a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// Why the connection was closed.
    pub reason: CloseReason,
    /// Phase the connection was in when teardown began.
    pub phase: Phase,
    /// Lines discarded from the pending queue.
    pub queued: usize,
    /// Lines written while the stream was saturated and never drained.
    pub backlog: usize,
    /// Traffic counters at close.
    pub stats: RelayStats,
    /// Time since the connection was opened.
    pub duration: Duration,
}

impl Connection {
    /// Tear the connection down.
    ///
    /// Disarms the connect deadline, destroys the stream (or in-flight
    /// connect), closes the WebSocket with `reason`'s code if it is still
    /// open, and discards queued data. Returns `false` without side effects
    /// if the connection is already closing or closed.
    pub fn terminate<I: ByteStream + FrameTransport>(&mut self, reason: CloseReason, io: &mut I) -> bool {
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            log::debug!("[Relay] {} already closed, ignoring '{}'", self.id, reason);
            return false;
        }

        let phase = self.phase;
        self.phase = Phase::Closing;

        if self.deadline_armed {
            io.disarm_connect_deadline();
            self.deadline_armed = false;
        }

        if self.stream_attached || self.connect_pending {
            io.destroy();
            self.stream_attached = false;
            self.connect_pending = false;
        }

        if self.frame_open {
            io.close_session(reason.code(), reason.as_str());
            self.frame_open = false;
        }

        let queued = self.pending.len();
        let backlog = self.backlog;
        self.pending.clear();
        self.backlog = 0;
        self.phase = Phase::Closed;

        let termination = Termination {
            reason,
            phase,
            queued,
            backlog,
            stats: self.stats,
            duration: self.opened_at.elapsed(),
        };

        if reason.is_failure() {
            log::warn!(
                "[Relay] {} closed: {} (code {}, target {}, phase {}, queued {}, backlog {}, {} frames in, {} frames out, {:.1?})",
                self.id,
                reason,
                reason.code(),
                self.target,
                phase,
                queued,
                backlog,
                termination.stats.frames_received,
                termination.stats.frames_sent,
                termination.duration
            );
        } else {
            log::info!(
                "[Relay] {} closed: {} (target {}, {} frames in, {} frames out, {:.1?})",
                self.id,
                reason,
                self.target,
                termination.stats.frames_received,
                termination.stats.frames_sent,
                termination.duration
            );
        }

        self.termination = Some(termination);
        true
    }

    /// Close the session because the server is going away.
    pub fn shutdown<I: ByteStream + FrameTransport>(&mut self, io: &mut I) -> bool {
        self.terminate(CloseReason::Shutdown, io)
    }

    /// Close the session after the idle window elapsed with no traffic.
    pub fn on_idle_timeout<I: ByteStream + FrameTransport>(&mut self, io: &mut I) -> bool {
        self.terminate(CloseReason::IdleTimeout, io)
    }
}
