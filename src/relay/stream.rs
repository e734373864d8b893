//! TCP-side events and the frame-to-stream write path.

use std::io;

use super::lifecycle::CloseReason;
use super::state::{Connection, Phase};
use super::transport::{ByteStream, FrameTransport};

impl Connection {
    /// The TCP connect finished.
    ///
    /// Moves to [`Phase::Active`] and flushes the pending queue in arrival
    /// order. If the session ended while the connect was in flight, the new
    /// stream is orphaned and destroyed immediately.
    pub fn on_stream_connected<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        self.connect_pending = false;

        if self.phase != Phase::Connecting {
            log::debug!("[Relay] {} discarding late TCP connection to {}", self.id, self.target);
            io.destroy();
            return;
        }

        if self.deadline_armed {
            io.disarm_connect_deadline();
            self.deadline_armed = false;
        }

        self.phase = Phase::Active;
        self.stream_attached = true;
        self.stream_writable = true;

        let queued = self.pending.len();
        log::info!("[Relay] {} connected to {} ({} queued)", self.id, self.target, queued);

        // Saturation only clears the writable flag; queued lines are still
        // handed to the stream so nothing accepted is lost.
        while let Some(line) = self.pending.pop() {
            self.write_through(&line, io);
        }

        if !self.stream_writable {
            self.pause_frame_intake(io);
        }
    }

    /// The TCP connect failed before the deadline.
    pub fn on_stream_connect_failed<I: ByteStream + FrameTransport>(&mut self, error: &io::Error, io: &mut I) {
        self.connect_pending = false;
        if self.phase != Phase::Connecting {
            return;
        }
        log::warn!("[Relay] {} connect to {} failed: {}", self.id, self.target, error);
        self.terminate(CloseReason::ConnectFailed, io);
    }

    /// The connect deadline fired.
    pub fn on_connect_deadline<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        self.deadline_armed = false;
        if self.phase == Phase::Connecting {
            self.terminate(CloseReason::ConnectTimeout, io);
        }
    }

    /// Forward one line to the TCP stream.
    ///
    /// Only valid while [`Phase::Active`]; anything else terminates the
    /// connection with [`CloseReason::NotReady`]. Once the stream reports
    /// saturation, every line written (including the one that saturated it)
    /// counts toward a backlog bounded by the queue limit, and inbound
    /// frames are paused until the stream drains.
    pub fn send<I: ByteStream + FrameTransport>(&mut self, line: &str, io: &mut I) {
        if self.phase != Phase::Active {
            self.terminate(CloseReason::NotReady, io);
            return;
        }

        if !self.stream_writable && self.backlog >= self.limits.max_queue_size {
            self.terminate(CloseReason::QueueOverflow, io);
            return;
        }

        self.write_through(line, io);
        if !self.stream_writable && !self.frame_read_paused {
            log::debug!("[Relay] {} TCP send buffer full, pausing frames", self.id);
            self.pause_frame_intake(io);
        }
    }

    /// The TCP send buffer emptied below its low-water mark.
    pub fn on_stream_drain<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        if self.phase != Phase::Active {
            return;
        }
        self.stream_writable = true;
        self.backlog = 0;
        if self.frame_read_paused {
            self.frame_read_paused = false;
            io.resume_frames();
        }
    }

    /// Bytes arrived from the TCP peer.
    ///
    /// The chunk is forwarded as one outbound frame, unmodified. If the
    /// frame buffer has reached its high-water mark, TCP reads pause until
    /// the buffer drains or the cooldown timer finds it below the mark.
    pub fn on_stream_data<I: ByteStream + FrameTransport>(&mut self, chunk: &[u8], io: &mut I) {
        if self.phase != Phase::Active {
            return;
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_to_frames += chunk.len() as u64;
        io.send_frame(chunk.to_vec());

        if io.buffered_amount() >= self.limits.frame_high_water {
            self.frame_writable = false;
            if !self.stream_read_paused {
                log::debug!(
                    "[Relay] {} WebSocket buffer at {} bytes, pausing TCP reads",
                    self.id,
                    io.buffered_amount()
                );
                self.stream_read_paused = true;
                io.pause_reading();
                io.resume_reading_after(self.limits.backpressure_cooldown);
            }
        }
    }

    /// The backpressure cooldown elapsed.
    pub fn on_resume_timer<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        if self.phase != Phase::Active || !self.stream_read_paused {
            return;
        }
        if io.buffered_amount() < self.limits.frame_high_water {
            self.resume_stream_reads(io);
        } else {
            io.resume_reading_after(self.limits.backpressure_cooldown);
        }
    }

    /// The TCP peer closed the stream.
    pub fn on_stream_closed<I: ByteStream + FrameTransport>(&mut self, io: &mut I) {
        self.terminate(CloseReason::StreamClosed, io);
    }

    /// The TCP stream failed.
    pub fn on_stream_error<I: ByteStream + FrameTransport>(&mut self, error: &io::Error, io: &mut I) {
        if self.phase == Phase::Active {
            log::warn!("[Relay] {} TCP error: {}", self.id, error);
        }
        self.terminate(CloseReason::StreamError, io);
    }

    pub(super) fn resume_stream_reads<S: ByteStream>(&mut self, io: &mut S) {
        self.frame_writable = true;
        if self.stream_read_paused {
            self.stream_read_paused = false;
            io.resume_reading();
        }
    }

    fn write_through<S: ByteStream>(&mut self, line: &str, io: &mut S) {
        self.stats.lines_written += 1;
        self.stats.bytes_to_stream += line.len() as u64;
        if !io.write_line(line) {
            self.stream_writable = false;
        }
        if !self.stream_writable {
            self.backlog += 1;
        }
    }
}
