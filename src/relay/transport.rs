//! Transport seams between the relay core and real I/O.
//!
//! The core never touches sockets. It issues commands through these two
//! traits and receives events through the `on_*` methods of
//! [`Connection`](super::Connection). The tokio driver in
//! `server::session` implements both traits for live sockets; tests
//! implement them with a recorder.
//!
//! Method names are distinct across the two traits so a single type can
//! implement both without disambiguation at call sites.

use std::time::Duration;

use crate::target::Target;

/// Commands the core issues to the TCP side.
pub trait ByteStream {
    /// Begin connecting to `target` and arm a deadline of `timeout`.
    ///
    /// Completion is reported through `on_stream_connected`,
    /// `on_stream_connect_failed`, or `on_connect_deadline`.
    fn connect(&mut self, target: &Target, timeout: Duration);

    /// Cancel the connect deadline.
    fn disarm_connect_deadline(&mut self);

    /// Write one normalized line.
    ///
    /// The line is always accepted. Returns `false` once the stream's send
    /// buffer is saturated; `on_stream_drain` follows when it empties.
    fn write_line(&mut self, line: &str) -> bool;

    /// Stop delivering inbound chunks.
    fn pause_reading(&mut self);

    /// Resume delivering inbound chunks.
    fn resume_reading(&mut self);

    /// Schedule an `on_resume_timer` event after `delay`.
    fn resume_reading_after(&mut self, delay: Duration);

    /// Tear down the stream (or the in-flight connect). Idempotent.
    fn destroy(&mut self);
}

/// Commands the core issues to the WebSocket side.
pub trait FrameTransport {
    /// Queue one outbound message carrying `payload`.
    fn send_frame(&mut self, payload: Vec<u8>);

    /// Bytes queued for the peer but not yet written.
    fn buffered_amount(&self) -> usize;

    /// Stop delivering inbound frames.
    fn pause_frames(&mut self);

    /// Resume delivering inbound frames.
    fn resume_frames(&mut self);

    /// Send a close frame with `code` and `reason`, then close.
    fn close_session(&mut self, code: u16, reason: &str);
}
