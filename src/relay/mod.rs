//! Relay core: one WebSocket session bridged to one TCP stream.
//!
//! The core is a synchronous state machine with no I/O of its own. Events
//! from either side enter through `on_*` methods on [`Connection`]; effects
//! leave through the [`ByteStream`] and [`FrameTransport`] traits.
//!
//! # Architecture
//!
//! ```text
//!   WebSocket peer                                   TCP peer
//!        │                                              ▲
//!        │ on_frame ──► normalize_line ──┬─► queue ─────┤ (Connecting)
//!        │                               └─► write_line ┘ (Active)
//!        │
//!        ◄──── send_frame ◄──── on_stream_data ◄────────┘
//! ```
//!
//! Backpressure runs both ways:
//!
//! - A saturated stream pauses inbound frames until `on_stream_drain`.
//!   Lines written while saturated count toward a backlog bounded by the
//!   queue limit.
//! - A full frame buffer pauses TCP reads until `on_frame_drain`, or until
//!   the cooldown timer sees the buffer below its high-water mark.
//!
//! Every exit goes through [`Connection::terminate`], which is idempotent.

// Rust guideline compliant 2026-02

mod frame;
mod lifecycle;
mod line;
mod queue;
mod state;
mod stream;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use lifecycle::{CloseReason, Termination};
pub use line::normalize_line;
pub use queue::PendingQueue;
pub use state::{Connection, ConnectionId, Phase, RelayStats};
pub use transport::{ByteStream, FrameTransport};
