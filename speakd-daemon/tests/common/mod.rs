//! Shared helpers for daemon integration tests
//!
//! Tests run a real daemon on an ephemeral port with a stand-in player
//! (`sh -c 'cat > /dev/null'`) so no audio hardware is needed.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use speakd_daemon::player::PlayerSpec;
use speakd_daemon::{DaemonConfig, DaemonServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// 100ms of 24kHz mono 16-bit audio
pub const CHUNK_100MS: usize = 4800;

pub fn shell_player(script: &str) -> PlayerSpec {
    PlayerSpec::Command {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

/// Config with a silent player and fast restart backoff
pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.player.streaming = vec![shell_player("cat > /dev/null")];
    config.player.file_fallback = None;
    config.player.restart_backoff_base_ms = 5;
    config.player.restart_backoff_max_ms = 20;
    config.player.terminate_grace_ms = 200;
    config
}

pub struct TestDaemon {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    pub async fn spawn(config: DaemonConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let server = DaemonServer::new(config);
        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    /// GET `path` and parse the JSON body
    pub async fn get_json(&self, path: &str) -> Value {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("daemon did not shut down")
            .unwrap()
            .unwrap();
    }
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Events read ahead while looking for a status reply
    pending: VecDeque<Value>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn start_session(&mut self) -> Value {
        self.send_json(json!({"type": "start_session", "data": {"sampleRate": 24000, "channels": 1, "bitDepth": 16}}))
            .await;
        self.wait_for("session_started", Duration::from_secs(5)).await
    }

    /// Send `len` bytes of silence as a base64 `audio_chunk`
    pub async fn send_chunk(&mut self, len: usize) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(vec![0u8; len]);
        self.send_json(json!({"type": "audio_chunk", "data": {"chunk": encoded}}))
            .await;
    }

    pub async fn end_stream(&mut self) {
        self.send_json(json!({"type": "end_stream"})).await;
    }

    pub async fn control(&mut self, action: &str) {
        self.send_json(json!({"type": "control", "data": {"action": action}}))
            .await;
    }

    /// Next event, or `None` if nothing arrives within `within`
    pub async fn recv_event(&mut self, within: Duration) -> Option<Value> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = tokio::time::timeout(remaining, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Skip events until one of type `kind` arrives
    pub async fn wait_for(&mut self, kind: &str, within: Duration) -> Value {
        self.collect_until(kind, within).await.pop().unwrap()
    }

    /// All events up to and including the first of type `kind`
    pub async fn collect_until(&mut self, kind: &str, within: Duration) -> Vec<Value> {
        let deadline = Instant::now() + within;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.recv_event(remaining).await.unwrap_or_else(|| {
                panic!("no {} event within {:?}; saw {:?}", kind, within, seen)
            });
            let done = event["type"] == kind;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Ask for a status snapshot.
    ///
    /// Status frames are also pushed on state changes, so the freshest one
    /// seen before the connection goes quiet is returned. Other events are
    /// kept for later reads.
    pub async fn status(&mut self) -> Value {
        self.send_json(json!({"type": "status"})).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut latest = None;
        let mut held = Vec::new();
        loop {
            let within = match latest {
                Some(_) => Duration::from_millis(100),
                None => deadline.saturating_duration_since(Instant::now()),
            };
            match self.recv_event(within).await {
                Some(event) if event["type"] == "status" => latest = Some(event["data"].clone()),
                Some(event) => held.push(event),
                None => break,
            }
        }
        self.pending.extend(held);
        latest.expect("no status reply")
    }

    pub async fn timing(&mut self) -> Value {
        self.send_json(json!({"type": "timing_analysis"})).await;
        self.wait_for("timing_analysis", Duration::from_secs(5)).await["data"]["timing"].clone()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
