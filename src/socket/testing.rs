//! In-process Socket.IO server for tests.
//!
//! Speaks just enough Engine.IO v4 to exercise the client: open packet,
//! connect/connect-error, pings, and canned replies to client events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    Reject(String),
    /// Accept the websocket, then say nothing.
    Silent,
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub handshake: Handshake,
    pub open_delay: Duration,
    pub ack_joins: bool,
    pub echo_messages: bool,
    pub ack_images: bool,
    /// Advertised in the open packet. Unless `keep_pinging` is set the
    /// server pings once, right after connect, and then goes quiet.
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub keep_pinging: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            handshake: Handshake::Accept,
            open_delay: Duration::ZERO,
            ack_joins: true,
            echo_messages: true,
            ack_images: true,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
            keep_pinging: false,
        }
    }
}

enum Outgoing {
    Text(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    accepted: AtomicUsize,
    pongs: AtomicUsize,
    next_id: AtomicUsize,
    behavior: Mutex<Behavior>,
    received: Mutex<Vec<(String, Value)>>,
    tokens: Mutex<Vec<String>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Outgoing>>>,
}

pub struct FakeServer {
    pub url: String,
    state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_state), tcp));
            }
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn set_behavior(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.state.behavior.lock().unwrap());
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn pongs(&self) -> usize {
        self.state.pongs.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    pub fn live_connections(&self) -> usize {
        let mut conns = self.state.connections.lock().unwrap();
        conns.retain(|c| !c.is_closed());
        conns.len()
    }

    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Names of every client event, in arrival order.
    pub fn event_names(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Push a server event to every live connection.
    pub fn push(&self, event: &str, data: Value) {
        let frame = format!("42{}", serde_json::json!([event, data]));
        for conn in self.state.connections.lock().unwrap().iter() {
            let _ = conn.send(Outgoing::Text(frame.clone()));
        }
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        for conn in self.state.connections.lock().unwrap().drain(..) {
            let _ = conn.send(Outgoing::Close);
        }
    }
}

/// A stored message as the server would broadcast it.
pub fn server_message(id: &str, conversation_id: &str, content: &str) -> Value {
    serde_json::json!({
        "_id": id,
        "conversationId": conversation_id,
        "sender": {"_id": "u1", "name": "Ada", "role": "customer"},
        "content": content,
        "messageType": "text",
        "readBy": [],
        "isDeleted": false,
        "createdAt": "2024-05-01T10:00:00Z"
    })
}

/// Poll `cond` every 10ms for up to 3 seconds.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn serve(state: Arc<ServerState>, tcp: TcpStream) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let behavior = state.behavior.lock().unwrap().clone();

    if let Handshake::Silent = behavior.handshake {
        while let Some(Ok(_)) = stream.next().await {}
        return;
    }

    tokio::time::sleep(behavior.open_delay).await;
    let open = serde_json::json!({
        "sid": "fake-sid",
        "upgrades": [],
        "pingInterval": behavior.ping_interval_ms,
        "pingTimeout": behavior.ping_timeout_ms,
        "maxPayload": 1_000_000,
    });
    if sink.send(WsMessage::Text(format!("0{}", open))).await.is_err() {
        return;
    }

    // Wait for the Socket.IO connect packet.
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) if text.starts_with("40") => {
                let auth: Value = serde_json::from_str(&text[2..]).unwrap_or(Value::Null);
                if let Some(token) = auth.get("token").and_then(|t| t.as_str()) {
                    state.tokens.lock().unwrap().push(token.to_string());
                }
                break;
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    }

    if let Handshake::Reject(message) = &behavior.handshake {
        let frame = format!("44{}", serde_json::json!({ "message": message }));
        let _ = sink.send(WsMessage::Text(frame)).await;
        let _ = sink.close().await;
        return;
    }

    if sink
        .send(WsMessage::Text(r#"40{"sid":"fake-socket"}"#.to_string()))
        .await
        .is_err()
    {
        return;
    }
    let _ = sink.send(WsMessage::Text("2".to_string())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.connections.lock().unwrap().push(tx);
    let mut pings = tokio::time::interval(Duration::from_millis(behavior.ping_interval_ms.max(1)));
    pings.tick().await;

    loop {
        tokio::select! {
            _ = pings.tick(), if behavior.keep_pinging => {
                if sink.send(WsMessage::Text("2".to_string())).await.is_err() {
                    return;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        for reply in handle_client_frame(&state, &text) {
                            if sink.send(WsMessage::Text(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(Outgoing::Text(text)) => {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}

fn handle_client_frame(state: &ServerState, text: &str) -> Vec<String> {
    if text == "3" {
        state.pongs.fetch_add(1, Ordering::SeqCst);
        return Vec::new();
    }
    let Some(body) = text.strip_prefix("42") else {
        return Vec::new();
    };
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(body) else {
        return Vec::new();
    };
    let name = items
        .first()
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let data = items.get(1).cloned().unwrap_or(Value::Null);
    state.received.lock().unwrap().push((name.clone(), data.clone()));

    let behavior = state.behavior.lock().unwrap().clone();
    let conversation_id = data["conversationId"].as_str().unwrap_or_default().to_string();
    let reply = |event: &str, payload: Value| format!("42{}", serde_json::json!([event, payload]));

    match name.as_str() {
        "join-conversation" if behavior.ack_joins => {
            vec![reply(
                "conversation-joined",
                serde_json::json!({ "conversationId": conversation_id }),
            )]
        }
        "send-message" if behavior.echo_messages => {
            let n = state.next_id.fetch_add(1, Ordering::SeqCst);
            let content = data["message"].as_str().unwrap_or_default();
            vec![reply(
                "message-received",
                server_message(&format!("srv-{}", n), &conversation_id, content),
            )]
        }
        "send-image-message" if behavior.ack_images => {
            let mut message = server_message(
                &uuid::Uuid::new_v4().to_string(),
                &conversation_id,
                data["fileName"].as_str().unwrap_or_default(),
            );
            message["messageType"] = "image".into();
            message["metadata"] = serde_json::json!({
                "imageUrl": format!("/uploads/{}", data["fileName"].as_str().unwrap_or_default()),
                "fileName": data["fileName"],
            });
            vec![reply(
                "image-message-sent",
                serde_json::json!({ "success": true, "message": message }),
            )]
        }
        _ => Vec::new(),
    }
}
