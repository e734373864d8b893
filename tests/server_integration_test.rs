//! End-to-end tests: real listener, loopback TCP backend, WebSocket client.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
#[cfg(target_os = "linux")]
use tokio::net::TcpSocket;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wsrelay::{Config, RelayServer, Target};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(adjust: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.listen = "127.0.0.1:0".to_string();
        adjust(&mut config);

        let server = RelayServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self { addr, shutdown, task }
    }

    async fn connect(&self, path: &str) -> Client {
        let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .unwrap();
        ws
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

async fn backend() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Read messages until the close frame; returns its code and reason.
async fn expect_close(ws: &mut Client) -> (u16, String) {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next()).await.unwrap();
        match message {
            Some(Ok(Message::Close(Some(frame)))) => return (u16::from(frame.code), frame.reason.to_string()),
            Some(Ok(Message::Close(None))) | None => panic!("closed without a close frame"),
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("websocket error before close: {e}"),
        }
    }
}

async fn expect_text(ws: &mut Client) -> String {
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return text.to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            other => panic!("expected text, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_plain_http_gets_status_page() {
    let harness = Harness::start(|_| {}).await;

    let mut socket = TcpStream::connect(harness.addr).await.unwrap();
    socket
        .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, socket.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: text/plain"));
    assert!(response.ends_with("running\n"));

    harness.stop().await;
}

#[tokio::test]
async fn test_relays_lines_both_ways() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| c.target = Some(target)).await;

    let mut ws = harness.connect("/").await;
    ws.send(Message::Text("hello".into())).await.unwrap();
    ws.send(Message::Text("already terminated\n".into())).await.unwrap();

    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("already terminated"));

    write_half.write_all(b"{\"result\":true}\n").await.unwrap();
    assert_eq!(expect_text(&mut ws).await, "{\"result\":true}\n");

    // Backend hangs up: client sees a normal close
    drop(write_half);
    drop(lines);
    assert_eq!(expect_close(&mut ws).await, (1000, "TCP closed".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_frames_sent_before_connect_arrive_in_order() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| c.target = Some(target)).await;

    let mut ws = harness.connect("/").await;
    for i in 0..20 {
        ws.send(Message::Text(format!("line {i}"))).await.unwrap();
    }

    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut lines = BufReader::new(socket).lines();
    for i in 0..20 {
        let line = tokio::time::timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line, Some(format!("line {i}")));
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_encoded_target_from_path() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| c.target = None).await;

    let encoded = Target::parse(&target).unwrap().encode();
    let mut ws = harness.connect(&format!("/{encoded}")).await;
    ws.send(Message::Text("ping".into())).await.unwrap();

    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut lines = BufReader::new(socket).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ping"));

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_address_closes_with_policy_code() {
    let harness = Harness::start(|c| c.target = None).await;

    let mut ws = harness.connect("/").await;
    assert_eq!(expect_close(&mut ws).await, (1008, "invalid address".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_blocked_target_is_forbidden() {
    let (_listener, target) = backend().await;
    let port = Target::parse(&target).unwrap().port();
    let harness = Harness::start(|c| {
        c.target = None;
        c.blocked_ports = vec![port];
    })
    .await;

    let encoded = Target::parse(&target).unwrap().encode();
    let mut ws = harness.connect(&format!("/{encoded}")).await;
    assert_eq!(expect_close(&mut ws).await, (1008, "forbidden target".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_refused_connect_closes_with_internal_error() {
    let (listener, target) = backend().await;
    drop(listener);
    let harness = Harness::start(|c| c.target = Some(target)).await;

    let mut ws = harness.connect("/").await;
    assert_eq!(expect_close(&mut ws).await, (1011, "TCP connect failed".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_oversized_message_closes_with_too_big() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.max_payload_length = 16;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (_socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    ws.send(Message::Text("x".repeat(17))).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, (1009, "payload too large".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_with_going_away() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| c.target = Some(target)).await;

    let mut ws = harness.connect("/").await;
    let (_socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    harness.shutdown.cancel();
    assert_eq!(expect_close(&mut ws).await, (1001, "server shutting down".to_string()));

    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_session_closes_with_normal_code() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.idle_timeout_secs = 1;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (_socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let started = Instant::now();

    assert_eq!(expect_close(&mut ws).await, (1000, "idle timeout".to_string()));
    assert!(started.elapsed() >= Duration::from_millis(900));

    harness.stop().await;
}

#[tokio::test]
async fn test_traffic_in_either_direction_resets_idle_timer() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.idle_timeout_secs = 1;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Client to backend only, for longer than the idle window
    for i in 0..6 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ws.send(Message::Text(format!("up {i}"))).await.unwrap();
        let line = tokio::time::timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line, Some(format!("up {i}")));
    }

    // Backend to client only
    for i in 0..6 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        write_half.write_all(format!("down {i}\n").as_bytes()).await.unwrap();
        assert_eq!(expect_text(&mut ws).await, format!("down {i}\n"));
    }

    let quiet = Instant::now();
    assert_eq!(expect_close(&mut ws).await, (1000, "idle timeout".to_string()));
    assert!(quiet.elapsed() >= Duration::from_millis(900));

    harness.stop().await;
}

#[tokio::test]
async fn test_zero_idle_timeout_never_closes() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.idle_timeout_secs = 0;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    ws.send(Message::Text("still here".into())).await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("still here"));
    write_half.write_all(b"ack\n").await.unwrap();
    assert_eq!(expect_text(&mut ws).await, "ack\n");

    harness.stop().await;
}

/// A listener whose accept queue is full, so further connects hang.
#[cfg(target_os = "linux")]
async fn unresponsive_backend() -> (TcpListener, Vec<TcpStream>, String) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            held.push(stream);
        }
    }
    (listener, held, addr.to_string())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_connect_deadline_closes_with_internal_error() {
    let (_listener, _held, target) = unresponsive_backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.connect_timeout_ms = 300;
    })
    .await;

    let started = Instant::now();
    let mut ws = harness.connect("/").await;
    assert_eq!(expect_close(&mut ws).await, (1011, "TCP connect timeout".to_string()));
    assert!(started.elapsed() >= Duration::from_millis(250));

    harness.stop().await;
}

#[tokio::test]
async fn test_backend_burst_survives_slow_websocket_reader() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.frame_high_water = 8 * 1024;
        c.frame_low_water = 2 * 1024;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (mut socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let expected: String = (0..4096).map(|i| format!("{i:06}{}\n", "x".repeat(1017))).collect();
    let payload = expected.clone();
    let writer = tokio::spawn(async move {
        socket.write_all(payload.as_bytes()).await.unwrap();
        socket
    });

    // Let the relay hit its frame high-water mark before reading anything
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut received = String::with_capacity(expected.len());
    while received.len() < expected.len() {
        received.push_str(&expect_text(&mut ws).await);
    }
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "relayed bytes differ from what the backend wrote");

    let _socket = tokio::time::timeout(WAIT, writer).await.unwrap().unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_client_burst_survives_slow_backend_reader() {
    let (listener, target) = backend().await;
    let harness = Harness::start(|c| {
        c.target = Some(target);
        c.stream_high_water = 1024;
        c.stream_low_water = 256;
    })
    .await;

    let mut ws = harness.connect("/").await;
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let sender = tokio::spawn(async move {
        for i in 0..2000 {
            ws.send(Message::Text(format!("line {i:05} {}", "y".repeat(4000)))).await.unwrap();
        }
        ws
    });

    // Backend stays silent long enough for the relay to saturate its TCP writer
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut lines = BufReader::new(socket).lines();
    for i in 0..2000 {
        let line = tokio::time::timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line, Some(format!("line {i:05} {}", "y".repeat(4000))));
    }

    let _ws = tokio::time::timeout(WAIT, sender).await.unwrap().unwrap();
    harness.stop().await;
}
