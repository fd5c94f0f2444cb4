//! Drives the transport-agnostic `Gateway` directly, without a WebSocket.

mod common;

use bytes::Bytes;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wssh::{
    driver::ShellEvent,
    gateway::Gateway,
    protocol::ServerMessage,
    registry::Registry,
    session::{InputMode, SessionState, STATUS_READY},
};

fn gateway(connector: &FakeConnector, mode: InputMode) -> Gateway {
    Gateway::new(Registry::new(16), Arc::new(connector.clone()), mode)
}

async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn output_only_reaches_the_owning_channel() {
    let connector = FakeConnector::default();
    let gateway = gateway(&connector, InputMode::Line);

    let (tx1, mut rx1) = mpsc::channel(16);
    let (tx2, mut rx2) = mpsc::channel(16);
    let ch1 = gateway.open_channel(tx1);
    let ch2 = gateway.open_channel(tx2);

    gateway.handle_message(ch1, &connect_msg("main").to_string()).await;
    assert_eq!(recv(&mut rx1).await, ServerMessage::status("main", STATUS_READY));
    let first = connector.next_backend().await;

    gateway.handle_message(ch2, &connect_msg("main").to_string()).await;
    assert_eq!(recv(&mut rx2).await, ServerMessage::status("main", STATUS_READY));
    let _second = connector.next_backend().await;

    first
        .events_tx
        .send(ShellEvent::Data(Bytes::from("one")))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx1).await, ServerMessage::data("main", "one".into()));
    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn raw_mode_forwards_each_keystroke() {
    let connector = FakeConnector::default();
    let gateway = gateway(&connector, InputMode::Raw);
    let (tx, mut rx) = mpsc::channel(16);
    let ch = gateway.open_channel(tx);

    gateway.handle_message(ch, &connect_msg("t").to_string()).await;
    recv(&mut rx).await;
    let mut backend = connector.next_backend().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for key in ["l", "s", "\r"] {
        gateway.handle_message(ch, &input_msg("t", key).to_string()).await;
    }
    for expected in ["l", "s", "\r"] {
        assert_eq!(backend.input_rx.recv().await.unwrap(), Bytes::from(expected));
    }
}

#[tokio::test]
async fn input_without_session_id_targets_the_only_session() {
    let connector = FakeConnector::default();
    let gateway = gateway(&connector, InputMode::Line);
    let (tx, mut rx) = mpsc::channel(16);
    let ch = gateway.open_channel(tx);

    gateway.handle_message(ch, &connect_msg("only").to_string()).await;
    recv(&mut rx).await;
    let mut backend = connector.next_backend().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    gateway
        .handle_message(ch, r#"{"type":"input","payload":"pwd\r"}"#)
        .await;
    assert_eq!(backend.input_rx.recv().await.unwrap(), Bytes::from("pwd\n"));
}

#[tokio::test]
async fn channel_close_cascades_to_every_shell() {
    let connector = FakeConnector::default();
    let gateway = gateway(&connector, InputMode::Line);
    let (tx, mut rx) = mpsc::channel(16);
    let ch = gateway.open_channel(tx);

    let mut backends = Vec::new();
    for id in ["a", "b", "c", "d"] {
        gateway.handle_message(ch, &connect_msg(id).to_string()).await;
        recv(&mut rx).await;
        backends.push(connector.next_backend().await);
    }

    assert_eq!(gateway.close_channel(ch), 4);
    assert!(backends.iter().all(|b| b.cancel.is_cancelled()));

    for b in &backends {
        let _ = b.events_tx.send(ShellEvent::Data(Bytes::from("late"))).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(gateway.registry().total_sessions(), 0);
}

#[tokio::test]
async fn channel_close_stops_session_mid_paste() {
    let connector = FakeConnector::default();
    let gateway = gateway(&connector, InputMode::Line);
    let (tx, mut rx) = mpsc::channel(16);
    let ch = gateway.open_channel(tx);

    gateway.handle_message(ch, &connect_msg("a").to_string()).await;
    recv(&mut rx).await;
    let mut backend = connector.next_backend().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let handle = gateway.registry().get_session(ch, "a").unwrap();

    // Remote tty echo. Nobody drains `rx`, so output backs up end to end.
    let echo = tokio::spawn(async move {
        let mut lines = 0usize;
        while let Some(data) = backend.input_rx.recv().await {
            lines += 1;
            if !backend.publish(ShellEvent::Data(data)).await {
                break;
            }
        }
        lines
    });

    let paste = "echo hi\r".repeat(500);
    gateway.handle_message(ch, &input_msg("a", &paste).to_string()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(gateway.close_channel(ch), 1);
    let state = tokio::time::timeout(Duration::from_secs(2), handle.terminated())
        .await
        .expect("session should stop after channel close");
    assert_eq!(state, SessionState::Closed);

    let lines = tokio::time::timeout(Duration::from_secs(2), echo)
        .await
        .expect("shell backend should stop after channel close")
        .unwrap();
    assert!(lines < 500);
    assert_eq!(gateway.registry().total_sessions(), 0);
}

#[tokio::test]
async fn long_unterminated_line_is_sent_at_the_limit() {
    let connector = FakeConnector::default();
    let gateway = Gateway::new(
        Registry::new(16).with_max_line_bytes(8),
        Arc::new(connector.clone()),
        InputMode::Line,
    );
    let (tx, mut rx) = mpsc::channel(16);
    let ch = gateway.open_channel(tx);

    gateway.handle_message(ch, &connect_msg("t").to_string()).await;
    recv(&mut rx).await;
    let mut backend = connector.next_backend().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    gateway
        .handle_message(ch, &input_msg("t", "0123456789").to_string())
        .await;
    assert_eq!(backend.input_rx.recv().await.unwrap(), Bytes::from("01234567"));
    gateway.handle_message(ch, &input_msg("t", "\r").to_string()).await;
    assert_eq!(backend.input_rx.recv().await.unwrap(), Bytes::from("89\n"));
}
