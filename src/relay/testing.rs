//! Recording transport for exercising the relay core without sockets.

use std::time::Duration;

use super::state::{Connection, ConnectionId};
use super::transport::{ByteStream, FrameTransport};
use crate::config::RelayLimits;
use crate::target::Target;

/// One command issued by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IoCall {
    Connect(String, Duration),
    DisarmDeadline,
    WriteLine(String),
    PauseReading,
    ResumeReading,
    ResumeReadingAfter(Duration),
    Destroy,
    SendFrame(Vec<u8>),
    PauseFrames,
    ResumeFrames,
    CloseSession(u16, String),
}

/// Transport double that records every call.
#[derive(Debug, Default)]
pub(crate) struct RecordingIo {
    pub calls: Vec<IoCall>,
    /// When set, `write_line` reports the stream as saturated.
    pub stream_saturated: bool,
    /// Value returned from `buffered_amount`.
    pub buffered: usize,
}

impl RecordingIo {
    pub fn writes(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                IoCall::WriteLine(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                IoCall::SendFrame(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                IoCall::CloseSession(code, reason) => Some((*code, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &IoCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

impl ByteStream for RecordingIo {
    fn connect(&mut self, target: &Target, timeout: Duration) {
        self.calls.push(IoCall::Connect(target.to_string(), timeout));
    }

    fn disarm_connect_deadline(&mut self) {
        self.calls.push(IoCall::DisarmDeadline);
    }

    fn write_line(&mut self, line: &str) -> bool {
        self.calls.push(IoCall::WriteLine(line.to_string()));
        !self.stream_saturated
    }

    fn pause_reading(&mut self) {
        self.calls.push(IoCall::PauseReading);
    }

    fn resume_reading(&mut self) {
        self.calls.push(IoCall::ResumeReading);
    }

    fn resume_reading_after(&mut self, delay: Duration) {
        self.calls.push(IoCall::ResumeReadingAfter(delay));
    }

    fn destroy(&mut self) {
        self.calls.push(IoCall::Destroy);
    }
}

impl FrameTransport for RecordingIo {
    fn send_frame(&mut self, payload: Vec<u8>) {
        self.calls.push(IoCall::SendFrame(payload));
    }

    fn buffered_amount(&self) -> usize {
        self.buffered
    }

    fn pause_frames(&mut self) {
        self.calls.push(IoCall::PauseFrames);
    }

    fn resume_frames(&mut self) {
        self.calls.push(IoCall::ResumeFrames);
    }

    fn close_session(&mut self, code: u16, reason: &str) {
        self.calls.push(IoCall::CloseSession(code, reason.to_string()));
    }
}

/// Open a connection to `app:3333` with default limits.
pub(crate) fn open_connection(io: &mut RecordingIo) -> Connection {
    open_connection_with(io, |_| {})
}

/// Open a connection after adjusting the default limits.
pub(crate) fn open_connection_with(io: &mut RecordingIo, adjust: impl FnOnce(&mut RelayLimits)) -> Connection {
    let mut limits = RelayLimits::default();
    adjust(&mut limits);
    let target = Target::new("app", 3333).expect("valid target");
    Connection::open(ConnectionId::from("test"), target, limits, io)
}
