//! WebSocket-side events.

use super::lifecycle::CloseReason;
use super::line::normalize_line;
use super::state::{Connection, Phase};
use super::transport::{ByteStream, FrameTransport};

impl Connection {
    /// A message arrived from the WebSocket peer.
    ///
    /// Oversized payloads terminate the session. Otherwise the payload is
    /// normalized to one line and either queued (while connecting) or
    /// written to the stream (once active). Frames after close are dropped.
    pub fn on_frame<I: ByteStream + FrameTransport>(&mut self, payload: &[u8], io: &mut I) {
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            log::debug!("[Relay] {} dropping frame after close", self.id);
            return;
        }

        if payload.len() > self.limits.max_payload_length {
            log::debug!(
                "[Relay] {} frame of {} bytes exceeds limit {}",
                self.id,
                payload.len(),
                self.limits.max_payload_length
            );
            self.terminate(CloseReason::PayloadTooLarge, io);
            return;
        }

        let line = normalize_line(payload);

        match self.phase {
            Phase::Connecting => {
                if self.pending.push(line).is_err() {
                    self.terminate(CloseReason::QueueOverflow, io);
                    return;
                }
                self.stats.frames_received += 1;
            }
            Phase::Active => {
                self.stats.frames_received += 1;
                self.send(&line, io);
            }
            Phase::Closing | Phase::Closed => {}
        }
    }

    /// The WebSocket peer closed the session.
    pub fn on_frame_closed<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        self.frame_open = false;
        self.terminate(CloseReason::FrameClosed, io);
    }

    /// The WebSocket session failed.
    pub fn on_frame_error<I: ByteStream + FrameTransport>(&mut self, error: &str, io: &mut I) {
        if !self.is_closed() {
            log::warn!("[Relay] {} WebSocket error: {}", self.id, error);
        }
        self.frame_open = false;
        self.terminate(CloseReason::FrameError, io);
    }

    /// The outbound frame buffer drained below its low-water mark.
    pub fn on_frame_drain<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        if self.phase != Phase::Active {
            return;
        }
        self.resume_stream_reads(io);
    }
}
