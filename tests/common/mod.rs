#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wssh::{
    api,
    driver::{
        shell_channel, Connector, DriverError, ExecOutput, Shell, ShellBackend, Target, Transport,
    },
    gateway::Gateway,
    registry::Registry,
    session::InputMode,
    shutdown::ShutdownCoordinator,
};

pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connector whose shells are in-memory channel pairs. Each opened shell's
/// backend half is queued for the test to drive.
#[derive(Clone, Default)]
pub struct FakeConnector {
    backends: Arc<Mutex<VecDeque<ShellBackend>>>,
    targets: Arc<Mutex<Vec<Target>>>,
    refuse: bool,
}

struct FakeTransport {
    cancel: CancellationToken,
    backends: Arc<Mutex<VecDeque<ShellBackend>>>,
}

impl FakeConnector {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.lock().clone()
    }

    /// Wait for the next shell opened through this connector.
    pub async fn next_backend(&self) -> ShellBackend {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(backend) = self.backends.lock().pop_front() {
                return backend;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no shell was opened in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        target: Target,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, DriverError>> {
        self.targets.lock().push(target);
        let refuse = self.refuse;
        let backends = self.backends.clone();
        async move {
            if refuse {
                return Err(DriverError::Connect("connection refused".into()));
            }
            Ok(Box::new(FakeTransport { cancel, backends }) as Box<dyn Transport>)
        }
        .boxed()
    }
}

impl Transport for FakeTransport {
    fn open_shell(self: Box<Self>) -> BoxFuture<'static, Result<Shell, DriverError>> {
        async move {
            let (shell, backend) = shell_channel(self.cancel.clone());
            self.backends.lock().push_back(backend);
            Ok(shell)
        }
        .boxed()
    }

    fn exec(
        self: Box<Self>,
        command: String,
    ) -> BoxFuture<'static, Result<ExecOutput, DriverError>> {
        async move {
            Ok(ExecOutput {
                output: format!("{command}\n"),
                exit_status: Some(0),
            })
        }
        .boxed()
    }
}

/// Create a test AppState backed by `connector`.
pub fn create_test_state(connector: FakeConnector, max_channels: usize) -> api::AppState {
    let gateway = Gateway::new(Registry::new(16), Arc::new(connector), InputMode::Line);
    api::AppState::new(gateway, ShutdownCoordinator::new(), max_channels)
}

pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

pub async fn connect_ws(addr: SocketAddr) -> (WsSink, WsStream) {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("WebSocket connect should succeed");
    ws.split()
}

pub async fn send_json(ws: &mut WsSink, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Receive next text message, parse as JSON.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Try to receive a JSON message, returning None if nothing arrives in time.
pub async fn try_recv_json(ws: &mut WsStream, timeout: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(timeout, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
        _ => None,
    }
}

pub fn connect_msg(session_id: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "connect",
        "sessionId": session_id,
        "host": "example.internal",
        "port": 22,
        "username": "alice",
        "password": "secret"
    })
}

pub fn input_msg(session_id: &str, payload: &str) -> serde_json::Value {
    serde_json::json!({"kind": "input", "sessionId": session_id, "payload": payload})
}
