//! In-process WebSocket peer for session tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

/// Listens on an ephemeral localhost port and hands out accepted sockets.
pub(crate) struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<MockConn>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, conns) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(MockConn { ws }).is_err() {
                        break;
                    }
                }
            }
        });

        Self { addr, accepted, conns, task }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// TCP connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_conn(&mut self) -> MockConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("listener stopped")
    }

    /// Stop listening; later connects are refused.
    pub(crate) async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Server side of one accepted socket.
pub(crate) struct MockConn {
    ws: WebSocketStream<TcpStream>,
}

impl MockConn {
    pub(crate) async fn recv_json(&mut self) -> Value {
        loop {
            let msg = timeout(WAIT, self.ws.next())
                .await
                .expect("no frame within timeout")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Next request envelope, skipping keepalive pings.
    pub(crate) async fn recv_request(&mut self) -> Value {
        loop {
            let frame = self.recv_json().await;
            if frame["req"][1] != "ping" {
                return frame;
            }
        }
    }

    pub(crate) async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Wait for `auth_request` and answer with a challenge payload.
    pub(crate) async fn challenge(&mut self, payload: Value) -> Value {
        let request = self.recv_json().await;
        assert_eq!(request["req"][1], "auth_request");
        self.send_json(json!({ "res": [0, "auth_challenge", payload, 0] })).await;
        request
    }

    /// Run a full successful handshake. Returns the `auth_verify` envelope.
    pub(crate) async fn accept_handshake(&mut self) -> Value {
        self.challenge(json!({ "challenge_message": "abc" })).await;
        let verify = self.recv_json().await;
        assert_eq!(verify["req"][1], "auth_verify");
        self.send_json(json!({ "res": [0, "auth_verify", [{ "success": true }], 0] })).await;
        verify
    }

    /// True once the client has closed the socket.
    pub(crate) async fn closed(&mut self) -> bool {
        let result = timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        result.is_ok()
    }

    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
