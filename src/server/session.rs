//! Tokio driver for one relayed session.
//!
//! Owns the live sockets for a [`Connection`] and turns socket readiness
//! into core events. Effects requested by the core are applied through
//! [`SessionIo`], which implements both transport traits.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────── run_session (select loop) ────────────┐
//!   WebSocket read ──┤ on_frame / on_frame_closed / on_frame_error         │
//!   TCP connect    ──┤ on_stream_connected / on_stream_connect_failed      │
//!   TCP read       ──┤ on_stream_data / on_stream_closed / on_stream_error │
//!   timers         ──┤ on_connect_deadline / on_resume_timer / idle        │
//!   writer events  ──┤ on_stream_drain / on_frame_drain                    │
//!                    └───────────────────────────────────────────────────┘
//!                         │                               │
//!                  StreamWriter task                FrameWriter task
//!                  (TCP write half)              (WebSocket sink half)
//! ```
//!
//! Writers own an unbounded channel and a shared byte counter. Crossing the
//! high-water mark marks the writer saturated; the task reports a drain
//! event once the counter falls to the low-water mark.

use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::replay::ReplayStream;
use crate::config::RelayLimits;
use crate::constants::{CLOSE_LINGER, READ_BUFFER_SIZE};
use crate::relay::{ByteStream, Connection, ConnectionId, FrameTransport, Termination};
use crate::target::Target;

/// Server-side WebSocket over a socket whose request head was sniffed.
pub type WsStream = WebSocketStream<ReplayStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;
type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Notifications from the writer tasks back to the session loop.
#[derive(Debug)]
enum SessionEvent {
    StreamDrained,
    StreamFailed(io::Error),
    FrameDrained,
    FrameFailed(String),
}

/// Byte accounting shared between a writer handle and its task.
#[derive(Debug)]
struct WriteGauge {
    buffered: AtomicUsize,
    saturated: AtomicBool,
    high_water: usize,
    low_water: usize,
}

impl WriteGauge {
    fn new(high_water: usize, low_water: usize) -> Arc<Self> {
        Arc::new(Self {
            buffered: AtomicUsize::new(0),
            saturated: AtomicBool::new(false),
            high_water,
            low_water,
        })
    }

    /// Account for `len` queued bytes. Returns `false` once saturated.
    fn queued(&self, len: usize) -> bool {
        let total = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if self.saturated.load(Ordering::Acquire) {
            return false;
        }
        if total < self.high_water {
            return true;
        }
        self.saturated.store(true, Ordering::Release);
        // The writer may have drained past the low mark before the flag was set
        self.buffered.load(Ordering::Acquire) <= self.low_water && self.saturated.swap(false, Ordering::AcqRel)
    }

    /// Account for `len` written bytes. Returns `true` if this write ended
    /// a saturation episode.
    fn written(&self, len: usize) -> bool {
        let remaining = self.buffered.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
        remaining <= self.low_water && self.saturated.swap(false, Ordering::AcqRel)
    }

    fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Handle to the task writing lines to the TCP stream.
#[derive(Debug)]
struct StreamWriter {
    tx: UnboundedSender<String>,
    gauge: Arc<WriteGauge>,
    handle: JoinHandle<()>,
}

impl StreamWriter {
    fn spawn(writer: OwnedWriteHalf, limits: &RelayLimits, events: UnboundedSender<SessionEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gauge = WriteGauge::new(limits.stream_high_water, limits.stream_low_water);
        let handle = tokio::spawn(Self::write_loop(writer, rx, Arc::clone(&gauge), events));
        Self { tx, gauge, handle }
    }

    fn write(&self, line: &str) -> bool {
        let writable = self.gauge.queued(line.len());
        // A closed channel means the task already failed and reported it
        let _ = self.tx.send(line.to_string());
        writable
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut rx: UnboundedReceiver<String>,
        gauge: Arc<WriteGauge>,
        events: UnboundedSender<SessionEvent>,
    ) {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                let _ = events.send(SessionEvent::StreamFailed(e));
                return;
            }
            if gauge.written(line.len()) {
                let _ = events.send(SessionEvent::StreamDrained);
            }
        }
        let _ = writer.shutdown().await;
    }
}

/// Commands for the WebSocket writer task.
#[derive(Debug)]
enum FrameCommand {
    Send(Message, usize),
    Close(u16, String),
}

/// Handle to the task writing messages to the WebSocket sink.
#[derive(Debug)]
struct FrameWriter {
    tx: Option<UnboundedSender<FrameCommand>>,
    gauge: Arc<WriteGauge>,
    handle: JoinHandle<()>,
}

impl FrameWriter {
    fn spawn(sink: WsSink, limits: &RelayLimits, events: UnboundedSender<SessionEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gauge = WriteGauge::new(limits.frame_high_water, limits.frame_low_water);
        let handle = tokio::spawn(Self::write_loop(sink, rx, Arc::clone(&gauge), events));
        Self {
            tx: Some(tx),
            gauge,
            handle,
        }
    }

    fn send(&self, command: FrameCommand) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(command);
        }
    }

    /// Stop accepting commands and wait for the task to flush and close.
    async fn finish(mut self) {
        self.tx = None;
        if tokio::time::timeout(CLOSE_LINGER * 2, &mut self.handle).await.is_err() {
            log::debug!("[Session] WebSocket writer did not finish in time");
            self.handle.abort();
        }
    }

    async fn write_loop(
        mut sink: WsSink,
        mut rx: UnboundedReceiver<FrameCommand>,
        gauge: Arc<WriteGauge>,
        events: UnboundedSender<SessionEvent>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                FrameCommand::Send(message, len) => {
                    if let Err(e) = sink.send(message).await {
                        let _ = events.send(SessionEvent::FrameFailed(e.to_string()));
                        return;
                    }
                    if gauge.written(len) {
                        let _ = events.send(SessionEvent::FrameDrained);
                    }
                }
                FrameCommand::Close(code, reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason),
                    };
                    let _ = tokio::time::timeout(CLOSE_LINGER, async {
                        sink.send(Message::Close(Some(frame))).await?;
                        sink.close().await
                    })
                    .await;
                    return;
                }
            }
        }
        let _ = tokio::time::timeout(CLOSE_LINGER, sink.close()).await;
    }
}

/// Live socket state behind the transport traits.
struct SessionIo {
    limits: RelayLimits,
    events: UnboundedSender<SessionEvent>,
    connecting: Option<ConnectFuture>,
    deadline: Option<Pin<Box<Sleep>>>,
    reader: Option<OwnedReadHalf>,
    stream_writer: Option<StreamWriter>,
    frames: FrameWriter,
    read_paused: bool,
    frames_paused: bool,
    resume_timer: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo")
            .field("connecting", &self.connecting.is_some())
            .field("attached", &self.reader.is_some())
            .field("read_paused", &self.read_paused)
            .field("frames_paused", &self.frames_paused)
            .finish_non_exhaustive()
    }
}

impl SessionIo {
    fn new(sink: WsSink, limits: RelayLimits, events: UnboundedSender<SessionEvent>) -> Self {
        let frames = FrameWriter::spawn(sink, &limits, events.clone());
        Self {
            limits,
            events,
            connecting: None,
            deadline: None,
            reader: None,
            stream_writer: None,
            frames,
            read_paused: false,
            frames_paused: false,
            resume_timer: None,
        }
    }

    /// Take ownership of a freshly connected stream.
    fn attach(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Session] Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.stream_writer = Some(StreamWriter::spawn(writer, &self.limits, self.events.clone()));
    }
}

impl ByteStream for SessionIo {
    fn connect(&mut self, target: &Target, timeout: Duration) {
        let addr = target.to_string();
        self.connecting = Some(Box::pin(async move { TcpStream::connect(addr).await }));
        self.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
    }

    fn disarm_connect_deadline(&mut self) {
        self.deadline = None;
    }

    fn write_line(&mut self, line: &str) -> bool {
        match &self.stream_writer {
            Some(writer) => writer.write(line),
            None => false,
        }
    }

    fn pause_reading(&mut self) {
        self.read_paused = true;
    }

    fn resume_reading(&mut self) {
        self.read_paused = false;
        self.resume_timer = None;
    }

    fn resume_reading_after(&mut self, delay: Duration) {
        self.resume_timer = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn destroy(&mut self) {
        self.connecting = None;
        self.deadline = None;
        self.reader = None;
        self.resume_timer = None;
        if let Some(writer) = self.stream_writer.take() {
            writer.handle.abort();
        }
    }
}

impl FrameTransport for SessionIo {
    fn send_frame(&mut self, payload: Vec<u8>) {
        let len = payload.len();
        self.frames.gauge.queued(len);
        let message = match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.frames.send(FrameCommand::Send(message, len));
    }

    fn buffered_amount(&self) -> usize {
        self.frames.gauge.buffered()
    }

    fn pause_frames(&mut self) {
        self.frames_paused = true;
    }

    fn resume_frames(&mut self) {
        self.frames_paused = false;
    }

    fn close_session(&mut self, code: u16, reason: &str) {
        self.frames.send(FrameCommand::Close(code, reason.to_string()));
    }
}

/// What woke the session loop.
enum Wake {
    Internal(SessionEvent),
    Connected(io::Result<TcpStream>),
    Deadline,
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Stream(io::Result<usize>),
    ResumeTimer,
    Idle,
    Shutdown,
}

/// Relay between `ws` and `target` until either side ends the session.
///
/// Returns the termination record, or `None` if the loop ended without one.
pub async fn run_session(
    id: ConnectionId,
    target: Target,
    limits: RelayLimits,
    ws: WsStream,
    shutdown: CancellationToken,
) -> Option<Termination> {
    let (sink, mut source) = ws.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut io = SessionIo::new(sink, limits, events_tx);
    let mut conn = Connection::open(id, target, limits, &mut io);

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut idle = limits.idle_timeout.map(|d| Box::pin(tokio::time::sleep(d)));

    while !conn.is_closed() {
        let wake = tokio::select! {
            Some(event) = events_rx.recv() => Wake::Internal(event),
            result = connect_or_pending(&mut io.connecting) => Wake::Connected(result),
            () = sleep_or_pending(&mut io.deadline) => Wake::Deadline,
            message = source.next(), if !io.frames_paused => Wake::Frame(message),
            result = read_or_pending(&mut io.reader, &mut buf), if !io.read_paused => Wake::Stream(result),
            () = sleep_or_pending(&mut io.resume_timer) => Wake::ResumeTimer,
            () = sleep_or_pending(&mut idle) => Wake::Idle,
            () = shutdown.cancelled() => Wake::Shutdown,
        };

        match wake {
            Wake::Internal(SessionEvent::StreamDrained) => conn.on_stream_drain(&mut io),
            Wake::Internal(SessionEvent::StreamFailed(e)) => conn.on_stream_error(&e, &mut io),
            Wake::Internal(SessionEvent::FrameDrained) => conn.on_frame_drain(&mut io),
            Wake::Internal(SessionEvent::FrameFailed(e)) => conn.on_frame_error(&e, &mut io),
            Wake::Connected(Ok(stream)) => {
                io.attach(stream);
                conn.on_stream_connected(&mut io);
            }
            Wake::Connected(Err(e)) => conn.on_stream_connect_failed(&e, &mut io),
            Wake::Deadline => conn.on_connect_deadline(&mut io),
            Wake::Frame(Some(Ok(message))) => match message {
                Message::Text(text) => {
                    touch(&mut idle, &limits);
                    conn.on_frame(text.as_bytes(), &mut io);
                }
                Message::Binary(data) => {
                    touch(&mut idle, &limits);
                    conn.on_frame(&data, &mut io);
                }
                Message::Close(_) => conn.on_frame_closed(&mut io),
                // Pings are answered by the protocol layer
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            },
            Wake::Frame(Some(Err(e))) => conn.on_frame_error(&e.to_string(), &mut io),
            Wake::Frame(None) => conn.on_frame_closed(&mut io),
            Wake::Stream(Ok(0)) => conn.on_stream_closed(&mut io),
            Wake::Stream(Ok(n)) => {
                touch(&mut idle, &limits);
                conn.on_stream_data(&buf[..n], &mut io);
            }
            Wake::Stream(Err(e)) => conn.on_stream_error(&e, &mut io),
            Wake::ResumeTimer => conn.on_resume_timer(&mut io),
            Wake::Idle => {
                conn.on_idle_timeout(&mut io);
            }
            Wake::Shutdown => {
                conn.shutdown(&mut io);
            }
        }
    }

    drop(source);
    io.destroy();
    io.frames.finish().await;
    conn.termination().cloned()
}

fn touch(idle: &mut Option<Pin<Box<Sleep>>>, limits: &RelayLimits) {
    if let (Some(sleep), Some(window)) = (idle.as_mut(), limits.idle_timeout) {
        sleep.as_mut().reset(Instant::now() + window);
    }
}

async fn sleep_or_pending(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => {
            sleep.as_mut().await;
            *slot = None;
        }
        None => std::future::pending().await,
    }
}

async fn connect_or_pending(slot: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match slot {
        Some(connect) => {
            let result = connect.as_mut().await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn read_or_pending(reader: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
