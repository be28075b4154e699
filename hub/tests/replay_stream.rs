//! End-to-end replay over a real socket: HTTP create, WebSocket auth, paced
//! frames, graceful close.

mod common;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{seeded_state, T0};
use replay_hub::config::HubConfig;
use replay_hub::state::AppState;

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = replay_hub::app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Create a stream over `[T0, T0 + 300)` and return `(channel, token)`.
async fn create_stream(addr: SocketAddr, speed: f64) -> (String, String) {
    let resp: Value = reqwest::Client::new()
        .post(format!("http://{addr}/v1/replay/create"))
        .json(&json!({
            "exchange": "binance",
            "symbol": "BTCUSDT",
            "interval": "1m",
            "playback_speed": speed,
            "start_time_unix_milli": T0 * 1000,
            "end_time_unix_milli": (T0 + 300) * 1000,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["candle_count"], 5);
    (
        resp["channel"].as_str().unwrap().to_string(),
        resp["token"].as_str().unwrap().to_string(),
    )
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/v1/replay/stream")).await.unwrap();
    ws
}

async fn send_auth(ws: &mut Client, channel: &str, token: &str) {
    let frame = json!({"type": "auth", "data": {"channel": channel, "token": token}});
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Read until the server closes. Returns the text frames and the close frame.
async fn read_to_close(ws: &mut Client) -> (Vec<Value>, Option<CloseFrame>) {
    let mut frames = Vec::new();
    let read = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
                Ok(Message::Close(frame)) => return frame,
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    };
    let close = tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("server did not close the stream");
    (frames, close)
}

fn assert_bye(close: Option<CloseFrame>) {
    let close = close.expect("close frame");
    assert_eq!(u16::from(close.code), 1000);
    assert_eq!(close.reason.as_str(), "bye");
}

fn epochs(frames: &[Value]) -> Vec<i64> {
    frames.iter().map(|f| f["epoch"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn authenticated_client_receives_every_candle_then_bye() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, token) = create_stream(addr, 600.0).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, &token).await;
    let (frames, close) = read_to_close(&mut ws).await;

    assert_eq!(epochs(&frames), vec![T0, T0 + 60, T0 + 120, T0 + 180, T0 + 240]);
    assert_eq!(frames[0]["pair"], "BTCUSDT");
    assert_eq!(frames[0]["exchange"], "binance");
    assert_eq!(frames[0]["close"], "43210.12345678");
    assert_eq!(frames[0]["volume"], "1.5");
    assert_bye(close);
}

#[tokio::test]
async fn wrong_token_closes_without_frames() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, _) = create_stream(addr, 600.0).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, "AAAAAAAAAAAAAAAAAAAA").await;
    let (frames, close) = read_to_close(&mut ws).await;

    assert!(frames.is_empty());
    assert_bye(close);
}

#[tokio::test]
async fn unknown_channel_closes_without_frames() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, "ch:does-not-exist", "whatever").await;
    let (frames, close) = read_to_close(&mut ws).await;

    assert!(frames.is_empty());
    assert_bye(close);
}

#[tokio::test]
async fn malformed_auth_payload_closes_without_frames() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, _) = create_stream(addr, 600.0).await;

    let mut ws = connect(addr).await;
    let frame = json!({"type": "auth", "data": {"channel": channel}});
    ws.send(Message::text(frame.to_string())).await.unwrap();
    let (frames, close) = read_to_close(&mut ws).await;

    assert!(frames.is_empty());
    assert_bye(close);
}

#[tokio::test]
async fn junk_frames_before_auth_are_skipped() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, token) = create_stream(addr, 600.0).await;

    let mut ws = connect(addr).await;
    ws.send(Message::text("not json")).await.unwrap();
    ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    send_auth(&mut ws, &channel, &token).await;
    let (frames, close) = read_to_close(&mut ws).await;

    assert_eq!(frames.len(), 5);
    assert_bye(close);
}

#[tokio::test]
async fn repeated_auth_is_ignored() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, token) = create_stream(addr, 600.0).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, &token).await;
    send_auth(&mut ws, &channel, "wrong-token-wrong-tok").await;
    let (frames, close) = read_to_close(&mut ws).await;

    assert_eq!(frames.len(), 5);
    assert_bye(close);
}

#[tokio::test]
async fn channel_can_be_replayed_again_within_ttl() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(state).await;
    let (channel, token) = create_stream(addr, 600.0).await;

    for _ in 0..2 {
        let mut ws = connect(addr).await;
        send_auth(&mut ws, &channel, &token).await;
        let (frames, close) = read_to_close(&mut ws).await;
        assert_eq!(epochs(&frames)[0], T0);
        assert_eq!(frames.len(), 5);
        assert_bye(close);
    }
}

#[tokio::test]
async fn swept_channel_is_rejected() {
    let config = HubConfig {
        stream_ttl_secs: 0,
        ..HubConfig::default()
    };
    let state = seeded_state(config, 10).await;
    let addr = start_server(Arc::clone(&state)).await;
    let (channel, token) = create_stream(addr, 600.0).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(state.registry.sweep(), 1);

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, &token).await;
    let (frames, close) = read_to_close(&mut ws).await;
    assert!(frames.is_empty());
    assert_bye(close);
}

#[tokio::test]
async fn process_shutdown_closes_live_sessions() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(Arc::clone(&state)).await;
    // Normal speed: one frame, then a minute of silence.
    let (channel, token) = create_stream(addr, 1.0).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, &token).await;
    let first = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(first, Message::Text(_)));

    state.shutdown.cancel();
    let (frames, close) = read_to_close(&mut ws).await;
    assert!(frames.is_empty());
    assert_bye(close);
}

#[tokio::test]
async fn dropped_client_ends_the_session() {
    let state = seeded_state(HubConfig::default(), 10).await;
    let addr = start_server(Arc::clone(&state)).await;
    // Normal speed: the remaining frames would take four more minutes.
    let (channel, token) = create_stream(addr, 1.0).await;

    let mut ws = connect(addr).await;
    send_auth(&mut ws, &channel, &token).await;
    let first = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(first, Message::Text(_)));
    assert_eq!(state.active_sessions(), 1);

    // Tear down the TCP stream without a close handshake.
    drop(ws);

    let ended = async {
        while state.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), ended)
        .await
        .expect("session still running after the client went away");
}
