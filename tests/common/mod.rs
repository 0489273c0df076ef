#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use termhub::api::{self, auth::Identity, auth::TokenTable, AppState};
use termhub::registry::{RegistrySettings, SessionRegistry};

pub const ALICE: &str = "alice-token";
pub const BOB: &str = "bob-token";
pub const ADMIN: &str = "admin-token";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub type WsTx = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type WsRx = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A broker listening on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.drain();
    }
}

fn token_table() -> TokenTable {
    let user = |id: &str, admin: bool| Identity {
        id: id.to_string(),
        admin,
    };
    TokenTable::new([
        (ALICE.to_string(), user("alice", false)),
        (BOB.to_string(), user("bob", false)),
        (ADMIN.to_string(), user("admin", true)),
    ])
}

pub async fn start_server(max_sessions: usize) -> TestServer {
    let registry = SessionRegistry::new(RegistrySettings {
        max_sessions,
        shell: "/bin/sh".to_string(),
        home_dir: std::env::temp_dir(),
        ..RegistrySettings::default()
    });
    let shutdown = CancellationToken::new();
    let state = AppState {
        registry: registry.clone(),
        shutdown: shutdown.clone(),
        tokens: Arc::new(token_table()),
    };
    let app = api::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        registry,
        shutdown,
    }
}

pub async fn connect_ws(addr: SocketAddr, token: &str) -> (WsTx, WsRx) {
    let (ws, _) = connect_async(format!("ws://{}/ws?token={}", addr, token))
        .await
        .unwrap();
    ws.split()
}

pub async fn send_json(tx: &mut WsTx, value: serde_json::Value) {
    tx.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Receive the next text message as JSON, skipping pings.
pub async fn recv_json(rx: &mut WsRx) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Receive messages until one satisfies `pred`, returning it.
pub async fn recv_until(
    rx: &mut WsRx,
    mut pred: impl FnMut(&serde_json::Value) -> bool,
) -> serde_json::Value {
    loop {
        let v = recv_json(rx).await;
        if pred(&v) {
            return v;
        }
    }
}

/// Issue a request and wait for the response carrying the same id.
pub async fn call(
    tx: &mut WsTx,
    rx: &mut WsRx,
    id: u64,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    send_json(
        tx,
        serde_json::json!({ "id": id, "method": method, "params": params }),
    )
    .await;
    recv_until(rx, |v| v["id"] == id).await
}

/// Create a session over the socket and return its id.
pub async fn create_session(tx: &mut WsTx, rx: &mut WsRx, id: u64) -> String {
    let resp = call(tx, rx, id, "create_session", serde_json::json!({})).await;
    resp["result"]["id"]
        .as_str()
        .unwrap_or_else(|| panic!("create failed: {resp}"))
        .to_string()
}

pub fn decode(event: &serde_json::Value) -> String {
    let data = event["data"].as_str().unwrap_or_default();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Accumulate output events for `session_id` until the text contains `needle`.
pub async fn wait_for_output(rx: &mut WsRx, session_id: &str, needle: &str) -> String {
    let mut seen = String::new();
    loop {
        let v = recv_json(rx).await;
        if v["session_id"] == session_id && (v["event"] == "output" || v["event"] == "replay") {
            seen.push_str(&decode(&v));
            if seen.contains(needle) {
                return seen;
            }
        }
    }
}
