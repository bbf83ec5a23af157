//! Real-time chat transport (Socket.IO over WebSocket)
//!
//! `ChatSocket` owns at most one live connection. It is constructed once by
//! the composition root and cloned into every consumer, so all conversation
//! sessions share one connection and one event stream.

pub mod events;
pub mod frame;
pub mod registry;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;

use crate::api::validation::ImageFile;
use crate::config::ChatSettings;
use crate::error::{ChatError, ChatResult};
use crate::models::{Message, MessageMetadata, MessageType};

pub use events::{ClientEvent, ConnectionState, ImageAck, PresenceEvent, SocketEvent, Topic, TypingEvent};
pub use registry::{EventRegistry, Subscription};

use frame::{OpenInfo, Packet};
use websocket::EngineSocket;

/// Floor for how often a live connection checks for a silent server.
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_millis(25);

/// Outcome of a connection attempt; `None` while still in flight.
type Outcome = Option<ChatResult<()>>;

enum LinkState {
    Disconnected,
    Connecting {
        attempt: u64,
        outcome: watch::Sender<Outcome>,
    },
    Connected {
        attempt: u64,
        token: String,
        outbound: mpsc::UnboundedSender<String>,
    },
}

impl LinkState {
    fn public(&self) -> ConnectionState {
        match self {
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Connecting { .. } => ConnectionState::Connecting,
            LinkState::Connected { .. } => ConnectionState::Connected,
        }
    }
}

struct Inner {
    socket_url: String,
    connect_timeout: Duration,
    image_ack_timeout: Duration,
    registry: EventRegistry,
    state: Mutex<LinkState>,
    next_attempt: AtomicU64,
    /// One image upload in flight at a time, so acks pair with sends.
    image_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: SocketEvent) {
        self.registry.publish(&event);
    }
}

/// Connection manager for the chat socket. Cheap to clone.
#[derive(Clone)]
pub struct ChatSocket {
    inner: Arc<Inner>,
}

impl ChatSocket {
    pub fn new(socket_url: &str, settings: &ChatSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                socket_url: socket_url.to_string(),
                connect_timeout: settings.connect_timeout(),
                image_ack_timeout: settings.image_ack_timeout(),
                registry: EventRegistry::new(),
                state: Mutex::new(LinkState::Disconnected),
                next_attempt: AtomicU64::new(0),
                image_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_state().public()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Connect with a bearer token.
    ///
    /// Callers arriving while an attempt is in flight wait for that attempt.
    /// Already connected with the same token resolves immediately; a different
    /// token replaces the connection.
    pub async fn connect(&self, token: &str) -> ChatResult<()> {
        let mut replaced = false;
        let mut started = None;

        let mut outcome = {
            let mut state = self.inner.lock_state();
            match &*state {
                LinkState::Connected { token: current, .. } if current == token => return Ok(()),
                LinkState::Connecting { outcome, .. } => outcome.subscribe(),
                _ => {
                    if matches!(&*state, LinkState::Connected { .. }) {
                        tracing::info!("Token changed, replacing chat connection");
                        replaced = true;
                    }
                    let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    let (tx, rx) = watch::channel(None);
                    // Dropping the old outbound sender closes the old socket.
                    *state = LinkState::Connecting {
                        attempt,
                        outcome: tx,
                    };
                    started = Some(attempt);
                    rx
                }
            }
        };

        if let Some(attempt) = started {
            if replaced {
                self.inner
                    .publish(SocketEvent::ConnectionChange(ConnectionState::Disconnected));
            }
            self.inner
                .publish(SocketEvent::ConnectionChange(ConnectionState::Connecting));
            tracing::debug!("Starting chat connection attempt {}", attempt);
            tokio::spawn(run_attempt(
                Arc::clone(&self.inner),
                attempt,
                token.to_string(),
            ));
        }

        let settled: Outcome = match outcome.wait_for(|o| o.is_some()).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(ChatError::Superseded))
    }

    /// Tear down the connection, drop every listener and reset to disconnected.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), LinkState::Disconnected);
        match previous {
            LinkState::Disconnected => {}
            LinkState::Connecting { attempt, outcome } => {
                tracing::info!("Cancelling chat connection attempt {}", attempt);
                outcome.send_replace(Some(Err(ChatError::Superseded)));
                self.inner
                    .publish(SocketEvent::ConnectionChange(ConnectionState::Disconnected));
            }
            LinkState::Connected { attempt, .. } => {
                tracing::info!("Disconnecting chat socket (attempt {})", attempt);
                self.inner
                    .publish(SocketEvent::ConnectionChange(ConnectionState::Disconnected));
            }
        }
        self.inner.registry.clear();
    }

    // -- Subscriptions --

    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.registry.subscribe(topic, Arc::new(handler))
    }

    pub fn on_message_received(
        &self,
        f: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::MessageReceived, move |ev| {
            if let SocketEvent::MessageReceived(m) = ev {
                f(m)
            }
        })
    }

    pub fn on_image_message_received(
        &self,
        f: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::ImageMessageReceived, move |ev| {
            if let SocketEvent::ImageMessageReceived(m) = ev {
                f(m)
            }
        })
    }

    pub fn on_image_message_sent(
        &self,
        f: impl Fn(&ImageAck) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::ImageMessageSent, move |ev| {
            if let SocketEvent::ImageMessageSent(ack) = ev {
                f(ack)
            }
        })
    }

    pub fn on_user_typing(
        &self,
        f: impl Fn(&TypingEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::UserTyping, move |ev| {
            if let SocketEvent::UserTyping(t) = ev {
                f(t)
            }
        })
    }

    pub fn on_user_joined(
        &self,
        f: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::UserJoined, move |ev| {
            if let SocketEvent::UserJoined(p) = ev {
                f(p)
            }
        })
    }

    pub fn on_user_left(
        &self,
        f: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::UserLeft, move |ev| {
            if let SocketEvent::UserLeft(p) = ev {
                f(p)
            }
        })
    }

    pub fn on_conversation_joined(
        &self,
        f: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::ConversationJoined, move |ev| {
            if let SocketEvent::ConversationJoined(id) = ev {
                f(id)
            }
        })
    }

    pub fn on_error(&self, f: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.subscribe(Topic::Error, move |ev| {
            if let SocketEvent::Error(msg) = ev {
                f(msg)
            }
        })
    }

    /// Subscribe to connection changes. The callback runs once immediately
    /// with the current state.
    pub fn on_connection_change(
        &self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let f = Arc::new(f);
        let handler = Arc::clone(&f);
        let sub = self.subscribe(Topic::ConnectionChange, move |ev| {
            if let SocketEvent::ConnectionChange(state) = ev {
                handler(*state)
            }
        });
        f(self.connection_state());
        sub
    }

    // -- Emits --

    fn emit(&self, event: ClientEvent) -> ChatResult<()> {
        let text = frame::encode_event(event.name(), &event.payload())?;
        let state = self.inner.lock_state();
        match &*state {
            LinkState::Connected { outbound, .. } => {
                outbound.send(text).map_err(|_| ChatError::NotConnected)
            }
            _ => Err(ChatError::NotConnected),
        }
    }

    pub fn join_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        self.emit(ClientEvent::JoinConversation {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Emit a message. Fails immediately when not connected; nothing is queued.
    pub fn send_message(
        &self,
        conversation_id: &str,
        message: &str,
        message_type: MessageType,
        metadata: Option<MessageMetadata>,
    ) -> ChatResult<()> {
        self.emit(ClientEvent::SendMessage {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            message_type,
            metadata,
        })
    }

    pub fn set_typing(&self, conversation_id: &str, is_typing: bool) -> ChatResult<()> {
        self.emit(ClientEvent::Typing {
            conversation_id: conversation_id.to_string(),
            is_typing,
        })
    }

    pub fn mark_as_read(&self, conversation_id: &str, message_id: Option<&str>) -> ChatResult<()> {
        self.emit(ClientEvent::MarkAsRead {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.map(String::from),
        })
    }

    /// Send an image over the socket and wait for the server's `image-message-sent`.
    pub async fn send_image_message(
        &self,
        conversation_id: &str,
        image: &ImageFile,
    ) -> ChatResult<Message> {
        image.validate()?;
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let _guard = self.inner.image_lock.lock().await;

        let (tx, rx) = oneshot::channel::<ImageAck>();
        let slot = Mutex::new(Some(tx));
        let _ack_sub = self.on_image_message_sent(move |ack| {
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(ack.clone());
            }
        });

        tracing::info!(
            "Sending image {} ({} bytes) to {}",
            image.file_name,
            image.size(),
            conversation_id
        );
        self.emit(ClientEvent::SendImageMessage {
            conversation_id: conversation_id.to_string(),
            image_data: image.to_base64(),
            file_name: image.file_name.clone(),
            file_size: image.size(),
            file_type: image.file_type.clone(),
        })?;

        match time::timeout(self.inner.image_ack_timeout, rx).await {
            Ok(Ok(ack)) => ack.into_message(),
            // Listener cleared by disconnect().
            Ok(Err(_)) => Err(ChatError::NotConnected),
            Err(_) => Err(ChatError::AckTimeout(self.inner.image_ack_timeout)),
        }
    }
}

/// How a finished attempt was settled against the current link state.
enum Settled {
    Stale(Option<EngineSocket>),
    Connected(watch::Sender<Outcome>),
    Failed(watch::Sender<Outcome>, ChatError),
}

/// Drive one connection attempt to completion and install its result,
/// unless a newer attempt or a disconnect replaced it meanwhile.
async fn run_attempt(inner: Arc<Inner>, attempt: u64, token: String) {
    let result = match time::timeout(inner.connect_timeout, open_session(&inner.socket_url, &token)).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::ConnectTimeout(inner.connect_timeout)),
    };

    let settled = {
        let mut state = inner.lock_state();
        match std::mem::replace(&mut *state, LinkState::Disconnected) {
            LinkState::Connecting { attempt: a, outcome } if a == attempt => match result {
                Ok((ws, info)) => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    *state = LinkState::Connected {
                        attempt,
                        token,
                        outbound: out_tx,
                    };
                    tokio::spawn(run_io(
                        Arc::clone(&inner),
                        attempt,
                        ws,
                        info.silence_limit(),
                        out_rx,
                    ));
                    Settled::Connected(outcome)
                }
                Err(e) => Settled::Failed(outcome, e),
            },
            other => {
                *state = other;
                Settled::Stale(result.ok().map(|(ws, _)| ws))
            }
        }
    };

    match settled {
        Settled::Stale(ws) => {
            tracing::debug!("Discarding result of superseded connection attempt {}", attempt);
            if let Some(mut ws) = ws {
                ws.close().await;
            }
        }
        Settled::Connected(outcome) => {
            tracing::info!("Chat socket connected (attempt {})", attempt);
            inner.publish(SocketEvent::ConnectionChange(ConnectionState::Connected));
            outcome.send_replace(Some(Ok(())));
        }
        Settled::Failed(outcome, e) => {
            tracing::warn!("Chat connection attempt {} failed: {}", attempt, e);
            inner.publish(SocketEvent::Error(e.to_string()));
            inner.publish(SocketEvent::ConnectionChange(ConnectionState::Disconnected));
            outcome.send_replace(Some(Err(e)));
        }
    }
}

/// WebSocket open, Engine.IO open packet, Socket.IO connect with auth.
async fn open_session(socket_url: &str, token: &str) -> ChatResult<(EngineSocket, OpenInfo)> {
    let mut ws = EngineSocket::connect(socket_url, token).await?;

    let first = ws
        .recv_frame()
        .await?
        .ok_or_else(|| ChatError::Handshake("connection closed before open packet".to_string()))?;
    let info = match frame::decode(&first)? {
        Packet::Open(info) => {
            tracing::debug!(
                "Engine.IO session {} (ping every {}ms)",
                info.sid,
                info.ping_interval
            );
            info
        }
        other => {
            return Err(ChatError::Handshake(format!(
                "expected open packet, got {:?}",
                other
            )))
        }
    };

    let auth = serde_json::json!({ "token": token });
    ws.send_text(&frame::encode_connect(Some(&auth))).await?;

    loop {
        let text = ws
            .recv_frame()
            .await?
            .ok_or_else(|| ChatError::Handshake("connection closed during handshake".to_string()))?;
        match frame::decode(&text)? {
            Packet::Connect(_) => return Ok((ws, info)),
            Packet::ConnectError(message) => return Err(ChatError::Handshake(message)),
            other => tracing::debug!("Ignoring packet during handshake: {:?}", other),
        }
    }
}

/// Reader/writer loop for an established connection.
///
/// With a `silence_limit`, a server that sends nothing (not even a ping)
/// for that long is treated as gone.
async fn run_io(
    inner: Arc<Inner>,
    attempt: u64,
    mut ws: EngineSocket,
    silence_limit: Option<Duration>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let check_every = silence_limit
        .map(|limit| (limit / 4).max(MIN_HEARTBEAT_CHECK))
        .unwrap_or(MIN_HEARTBEAT_CHECK);
    let mut heartbeat = time::interval(check_every);
    heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = heartbeat.tick(), if silence_limit.is_some() => {
                if let Some(limit) = silence_limit {
                    if ws.quiet_for() > limit {
                        break format!("ping timeout (nothing from server for {:?})", limit);
                    }
                }
            }
            frame = ws.recv_frame() => {
                match frame {
                    Ok(Some(text)) => {
                        if let Some(reason) = handle_frame(&inner, &text) {
                            break reason;
                        }
                    }
                    Ok(None) => break "connection closed by server".to_string(),
                    Err(e) => break e.to_string(),
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = ws.send_text(&text).await {
                            break e.to_string();
                        }
                    }
                    None => {
                        // All senders dropped: disconnect() or a replacing connect().
                        ws.close().await;
                        return;
                    }
                }
            }
        }
    };

    ws.close().await;

    let is_current = {
        let mut state = inner.lock_state();
        if matches!(&*state, LinkState::Connected { attempt: a, .. } if *a == attempt) {
            *state = LinkState::Disconnected;
            true
        } else {
            false
        }
    };
    if is_current {
        tracing::warn!("Chat socket lost: {}", reason);
        inner.publish(SocketEvent::ConnectionChange(ConnectionState::Disconnected));
    }
}

/// Dispatch one inbound frame. Returns a reason when the connection is over.
fn handle_frame(inner: &Inner, text: &str) -> Option<String> {
    let packet = match frame::decode(text) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("Undecodable frame ({}): {}", e, text);
            return None;
        }
    };

    match packet {
        Packet::Event { name, data } => match SocketEvent::from_wire(&name, data) {
            Ok(Some(event)) => inner.publish(event),
            Ok(None) => tracing::debug!("Unhandled event: {}", name),
            Err(e) => tracing::warn!("Malformed {} event: {}", name, e),
        },
        Packet::Disconnect => return Some("server closed the chat namespace".to_string()),
        Packet::Close => return Some("server closed the session".to_string()),
        Packet::ConnectError(message) => {
            inner.publish(SocketEvent::Error(message.clone()));
            return Some(message);
        }
        other => tracing::debug!("Ignoring packet: {:?}", other),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use testing::{eventually, FakeServer, Handshake};
    use tokio_test::{assert_err, assert_ok};

    fn settings() -> ChatSettings {
        ChatSettings {
            connect_timeout_ms: 2000,
            image_ack_timeout_ms: 500,
            ..ChatSettings::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_socket() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| b.open_delay = Duration::from_millis(200));
        let socket = ChatSocket::new(&server.url, &settings());

        let attempts = (0..5).map(|_| {
            let socket = socket.clone();
            async move { socket.connect("tok").await }
        });
        let results = futures::future::join_all(attempts).await;

        assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
        assert_eq!(server.accepted(), 1);
        assert!(socket.is_connected());

        // Same token again: no new socket.
        assert_ok!(socket.connect("tok").await);
        assert_eq!(server.accepted(), 1);
        assert_eq!(server.tokens(), vec!["tok".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_failure() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| {
            b.handshake = Handshake::Reject("Authentication error".into());
            b.open_delay = Duration::from_millis(100);
        });
        let socket = ChatSocket::new(&server.url, &settings());

        let (a, b) = tokio::join!(socket.connect("bad"), socket.connect("bad"));
        assert!(matches!(a, Err(ChatError::Handshake(ref m)) if m == "Authentication error"));
        assert!(matches!(b, Err(ChatError::Handshake(ref m)) if m == "Authentication error"));
        assert_eq!(server.accepted(), 1);
        assert_eq!(socket.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| b.handshake = Handshake::Silent);
        let socket = ChatSocket::new(
            &server.url,
            &ChatSettings {
                connect_timeout_ms: 200,
                ..ChatSettings::default()
            },
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _sub = socket.on_error(move |msg| sink.lock().unwrap().push(msg.to_string()));

        let err = socket.connect("tok").await.unwrap_err();
        assert!(matches!(err, ChatError::ConnectTimeout(_)));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(socket.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_supersedes_in_flight_attempt() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| b.open_delay = Duration::from_millis(300));
        let socket = ChatSocket::new(&server.url, &settings());

        let pending = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.connect("tok").await })
        };
        assert!(eventually(|| socket.connection_state() == ConnectionState::Connecting).await);
        socket.disconnect();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ChatError::Superseded)));

        // The late success of the old attempt must not flip the state.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(socket.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_change_replays_current_state() {
        let server = FakeServer::start().await;
        let socket = ChatSocket::new(&server.url, &settings());
        assert_ok!(socket.connect("tok").await);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = socket.on_connection_change(move |s| sink.lock().unwrap().push(s));
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Connected]);

        server.drop_connections();
        assert!(eventually(|| seen.lock().unwrap().len() == 2).await);
        assert_eq!(seen.lock().unwrap()[1], ConnectionState::Disconnected);
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_silent_server_counts_as_lost() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| {
            b.ping_interval_ms = 100;
            b.ping_timeout_ms = 100;
        });
        let socket = ChatSocket::new(&server.url, &settings());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = socket.on_connection_change(move |s| sink.lock().unwrap().push(s));

        assert_ok!(socket.connect("tok").await);
        assert!(eventually(|| seen.lock().unwrap().len() == 4).await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_server_pings_keep_connection_alive() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| {
            b.ping_interval_ms = 50;
            b.ping_timeout_ms = 50;
            b.keep_pinging = true;
        });
        let socket = ChatSocket::new(&server.url, &settings());
        assert_ok!(socket.connect("tok").await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(socket.is_connected());
        assert!(server.pongs() >= 3);
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let socket = ChatSocket::new("http://127.0.0.1:9", &settings());
        assert!(matches!(
            socket.send_message("c1", "hello", MessageType::Text, None),
            Err(ChatError::NotConnected)
        ));
        let img = ImageFile::new("a.png", "image/png", vec![1]).unwrap();
        assert!(matches!(
            socket.send_image_message("c1", &img).await,
            Err(ChatError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers_and_answers_pings() {
        let server = FakeServer::start().await;
        let socket = ChatSocket::new(&server.url, &settings());
        let received = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&received);
        let _sub = socket.on_message_received(move |m| {
            assert_eq!(m.conversation_id, "c1");
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_ok!(socket.connect("tok").await);
        assert_ok!(socket.send_message("c1", "Is the ballroom free?", MessageType::Text, None));

        assert!(eventually(|| received.load(Ordering::SeqCst) == 1).await);
        let sent = server.events_named("send-message");
        assert_eq!(sent[0]["message"], "Is the ballroom free?");
        assert_eq!(sent[0]["messageType"], "text");
        assert!(eventually(|| server.pongs() >= 1).await);
    }

    #[tokio::test]
    async fn test_image_send_waits_for_ack() {
        let server = FakeServer::start().await;
        let socket = ChatSocket::new(&server.url, &settings());
        assert_ok!(socket.connect("tok").await);

        let img = ImageFile::new("proof.jpg", "image/jpeg", vec![1, 2, 3]).unwrap();
        let msg = socket.send_image_message("c1", &img).await.unwrap();
        assert_eq!(msg.conversation_id, "c1");

        let sent = server.events_named("send-image-message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["imageData"], "AQID");
        assert_eq!(sent[0]["fileSize"], 3);
    }

    #[tokio::test]
    async fn test_image_send_times_out_without_ack() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| b.ack_images = false);
        let socket = ChatSocket::new(&server.url, &settings());
        assert_ok!(socket.connect("tok").await);

        let img = ImageFile::new("proof.jpg", "image/jpeg", vec![1]).unwrap();
        let err = assert_err!(socket.send_image_message("c1", &img).await);
        assert!(matches!(err, ChatError::AckTimeout(_)));
    }

    #[tokio::test]
    async fn test_disconnect_clears_listeners() {
        let server = FakeServer::start().await;
        let socket = ChatSocket::new(&server.url, &settings());
        let _sub = socket.on_error(|_| {});
        assert_ok!(socket.connect("tok").await);

        socket.disconnect();
        assert_eq!(socket.inner.registry.handler_count(Topic::Error), 0);
        assert_eq!(socket.connection_state(), ConnectionState::Disconnected);
        assert!(eventually(|| server.live_connections() == 0).await);
    }
}
