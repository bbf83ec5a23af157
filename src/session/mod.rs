//! Conversation session: history, live updates, typing and reconnection
//!
//! A `ConversationSession` binds one conversation id to the shared
//! [`ChatSocket`] and the REST API. It keeps two independent state machines:
//!
//! - history: `Idle` -> `Loading` -> `Loaded`
//! - connection: `Disconnected` -> `Connecting` -> `Connected` -> `Joined`
//!
//! Every incoming message, whatever path delivered it, enters the list through
//! [`MessageLog`], which drops ids it has already seen. Front-ends observe the
//! session through [`ConversationSession::subscribe_updates`] and
//! [`ConversationSession::snapshot`].

pub mod backoff;
pub mod log;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time;

use crate::api::chat;
use crate::api::validation::ImageFile;
use crate::api::ChatApi;
use crate::config::ChatSettings;
use crate::error::{ChatError, ChatResult};
use crate::models::{Message, MessageType};
use crate::socket::{ChatSocket, ConnectionState, ImageAck, PresenceEvent, Subscription, TypingEvent};

pub use backoff::ReconnectPolicy;
pub use log::MessageLog;

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPhase {
    Idle,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and registered in the conversation room.
    Joined,
}

/// Change notifications for front-ends.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    MessageAdded(Message),
    MessageUpdated(Message),
    HistoryLoaded { count: usize },
    OlderLoaded { count: usize },
    Cleared,
    ConversationChanged(String),
    Typing {
        user_id: String,
        user_name: String,
        is_typing: bool,
    },
    Presence { user_id: String, online: bool },
    Connection(ConnectionPhase),
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectExhausted,
    Error(String),
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub history: HistoryPhase,
    pub connection: ConnectionPhase,
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// Names of users currently typing, sorted.
    pub typing: Vec<String>,
    /// Ids of participants seen joining, sorted.
    pub online: Vec<String>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    /// Automatic reconnection gave up; only a manual reconnect or a send retries.
    pub exhausted: bool,
}

impl SessionSnapshot {
    pub fn is_reconnecting(&self) -> bool {
        self.connection == ConnectionPhase::Disconnected
            && self.reconnect_attempts > 0
            && !self.exhausted
    }
}

struct SessionState {
    conversation_id: String,
    /// Bumped on every conversation switch; in-flight loads compare against it.
    generation: u64,
    history: HistoryPhase,
    connection: ConnectionPhase,
    messages: MessageLog,
    next_page: Option<u32>,
    typing: HashMap<String, String>,
    online: HashSet<String>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    exhausted: bool,
}

impl SessionState {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            generation: 0,
            history: HistoryPhase::Idle,
            connection: ConnectionPhase::Disconnected,
            messages: MessageLog::new(),
            next_page: None,
            typing: HashMap::new(),
            online: HashSet::new(),
            last_error: None,
            reconnect_attempts: 0,
            exhausted: false,
        }
    }
}

struct Shared {
    socket: ChatSocket,
    api: ChatApi,
    settings: ChatSettings,
    policy: ReconnectPolicy,
    state: Mutex<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    joined: Notify,
    subscriptions: Mutex<Vec<Subscription>>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn notify(&self, update: SessionUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }

    fn conversation_id(&self) -> String {
        self.state().conversation_id.clone()
    }

    fn record_error(&self, error: &ChatError) {
        let text = error.user_message();
        self.state().last_error = Some(text.clone());
        self.notify(SessionUpdate::Error(text));
    }

    /// Single entry point for messages into the list.
    fn admit(&self, message: Message) -> bool {
        let added = {
            let mut state = self.state();
            if message.conversation_id != state.conversation_id {
                return false;
            }
            state.messages.push(message.clone())
        };
        if added {
            self.notify(SessionUpdate::MessageAdded(message));
        }
        added
    }

    fn listening(&self) -> bool {
        let subs = lock(&self.subscriptions);
        !subs.is_empty() && subs.iter().all(Subscription::is_active)
    }

    fn should_reconnect(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.listening() && !self.socket.is_connected()
    }

    fn on_connection(self: &Arc<Self>, change: ConnectionState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match change {
            ConnectionState::Connecting => {
                self.state().connection = ConnectionPhase::Connecting;
                self.notify(SessionUpdate::Connection(ConnectionPhase::Connecting));
            }
            ConnectionState::Connected => {
                let conversation_id = {
                    let mut state = self.state();
                    state.connection = ConnectionPhase::Connected;
                    state.reconnect_attempts = 0;
                    state.exhausted = false;
                    state.conversation_id.clone()
                };
                self.notify(SessionUpdate::Connection(ConnectionPhase::Connected));
                if let Err(e) = self.socket.join_conversation(&conversation_id) {
                    tracing::debug!("Join of {} not sent: {}", conversation_id, e);
                }
            }
            ConnectionState::Disconnected => {
                let was_up = {
                    let mut state = self.state();
                    let previous = std::mem::replace(&mut state.connection, ConnectionPhase::Disconnected);
                    state.typing.clear();
                    matches!(previous, ConnectionPhase::Connected | ConnectionPhase::Joined)
                };
                self.notify(SessionUpdate::Connection(ConnectionPhase::Disconnected));
                if was_up {
                    schedule_reconnect(self);
                }
            }
        }
    }

    fn on_joined(&self, conversation_id: &str) {
        let joined = {
            let mut state = self.state();
            let ready = matches!(state.connection, ConnectionPhase::Connected | ConnectionPhase::Joined);
            if ready && state.conversation_id == conversation_id {
                state.connection = ConnectionPhase::Joined;
                true
            } else {
                false
            }
        };
        if joined {
            tracing::debug!("Joined conversation {}", conversation_id);
            self.joined.notify_waiters();
            self.notify(SessionUpdate::Connection(ConnectionPhase::Joined));
        }
    }

    fn on_typing(&self, event: &TypingEvent) {
        {
            let mut state = self.state();
            if event
                .conversation_id
                .as_deref()
                .is_some_and(|c| c != state.conversation_id)
            {
                return;
            }
            if event.is_typing {
                state
                    .typing
                    .insert(event.user_id.clone(), event.user_name.clone());
            } else {
                state.typing.remove(&event.user_id);
            }
        }
        self.notify(SessionUpdate::Typing {
            user_id: event.user_id.clone(),
            user_name: event.user_name.clone(),
            is_typing: event.is_typing,
        });
    }

    fn on_presence(&self, event: &PresenceEvent, online: bool) {
        let Some(user_id) = event.user_id.clone() else {
            return;
        };
        {
            let mut state = self.state();
            if event
                .conversation_id
                .as_deref()
                .is_some_and(|c| c != state.conversation_id)
            {
                return;
            }
            if online {
                state.online.insert(user_id.clone());
            } else {
                state.online.remove(&user_id);
                state.typing.remove(&user_id);
            }
        }
        self.notify(SessionUpdate::Presence { user_id, online });
    }

    fn on_server_error(&self, message: &str) {
        self.state().last_error = Some(message.to_string());
        self.notify(SessionUpdate::Error(message.to_string()));
    }

    fn take_typing_timer(&self) -> Option<JoinHandle<()>> {
        lock(&self.typing_timer).take()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.take_typing_timer() {
            timer.abort();
        }
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }
}

/// Wrap a session callback so socket handlers never keep the session alive.
fn weak_handler<T: ?Sized + 'static>(
    weak: &Weak<Shared>,
    f: impl Fn(&Arc<Shared>, &T) + Send + Sync + 'static,
) -> impl Fn(&T) + Send + Sync + 'static {
    let weak = weak.clone();
    move |value| {
        if let Some(shared) = weak.upgrade() {
            f(&shared, value)
        }
    }
}

fn install_handlers(shared: &Arc<Shared>) {
    let socket = &shared.socket;
    let weak = Arc::downgrade(shared);

    let mut subs = vec![
        socket.on_message_received(weak_handler(&weak, |s, m: &Message| {
            s.admit(m.clone());
        })),
        socket.on_image_message_received(weak_handler(&weak, |s, m: &Message| {
            s.admit(m.clone());
        })),
        socket.on_image_message_sent(weak_handler(&weak, |s, ack: &ImageAck| {
            if let Ok(message) = ack.clone().into_message() {
                s.admit(message);
            }
        })),
        socket.on_user_typing(weak_handler(&weak, |s, ev: &TypingEvent| s.on_typing(ev))),
        socket.on_user_joined(weak_handler(&weak, |s, ev: &PresenceEvent| {
            s.on_presence(ev, true)
        })),
        socket.on_user_left(weak_handler(&weak, |s, ev: &PresenceEvent| {
            s.on_presence(ev, false)
        })),
        socket.on_conversation_joined(weak_handler(&weak, |s, id: &str| s.on_joined(id))),
        socket.on_error(weak_handler(&weak, |s, msg: &str| s.on_server_error(msg))),
    ];

    // Registered last: the immediate replay may emit a join.
    let conn_weak = weak.clone();
    subs.push(socket.on_connection_change(move |change| {
        if let Some(shared) = conn_weak.upgrade() {
            shared.on_connection(change);
        }
    }));

    *lock(&shared.subscriptions) = subs;
}

fn schedule_reconnect(shared: &Arc<Shared>) {
    if shared.closed.load(Ordering::SeqCst) {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No async runtime, not scheduling chat reconnect");
        return;
    };
    let mut slot = lock(&shared.reconnect_task);
    if slot.as_ref().is_some_and(|task| !task.is_finished()) {
        return;
    }
    *slot = Some(runtime.spawn(reconnect_loop(Arc::downgrade(shared))));
}

/// Automatic reconnection with exponential backoff. Stops when the socket is
/// back, the session is gone, or the attempts are used up.
async fn reconnect_loop(weak: Weak<Shared>) {
    loop {
        let delay = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.should_reconnect() {
                return;
            }
            let attempt = shared.state().reconnect_attempts + 1;
            match shared.policy.delay_for(attempt) {
                Some(delay) => {
                    shared.state().reconnect_attempts = attempt;
                    tracing::info!(
                        "Chat reconnect attempt {}/{} in {:?}",
                        attempt,
                        shared.policy.max_attempts,
                        delay
                    );
                    shared.notify(SessionUpdate::Reconnecting { attempt, delay });
                    delay
                }
                None => {
                    {
                        let mut state = shared.state();
                        state.exhausted = true;
                        state.last_error =
                            Some("Unable to reconnect to chat. Try reconnecting manually.".to_string());
                    }
                    tracing::warn!(
                        "Giving up on chat reconnect after {} attempts",
                        shared.policy.max_attempts
                    );
                    shared.notify(SessionUpdate::ReconnectExhausted);
                    return;
                }
            }
        };

        time::sleep(delay).await;

        let (socket, token) = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.should_reconnect() {
                return;
            }
            (shared.socket.clone(), shared.api.token().to_string())
        };

        match socket.connect(&token).await {
            // Could have dropped again before this task finished.
            Ok(()) if socket.is_connected() => return,
            Ok(()) => {}
            Err(e) => {
                tracing::warn!("Chat reconnect failed: {}", e);
                if let Some(shared) = weak.upgrade() {
                    shared.record_error(&e);
                }
            }
        }
    }
}

/// State for one open conversation. Cheap to clone; the session closes when
/// the last clone is dropped or [`ConversationSession::close`] is called.
#[derive(Clone)]
pub struct ConversationSession {
    shared: Arc<Shared>,
}

impl ConversationSession {
    /// Bind to `conversation_id`: subscribe to the socket, then load history
    /// and connect in the background. Must be called inside a tokio runtime.
    pub fn open(
        socket: ChatSocket,
        api: ChatApi,
        settings: &ChatSettings,
        conversation_id: impl Into<String>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Arc::new(Shared {
            socket,
            api,
            settings: settings.clone(),
            policy: ReconnectPolicy::from_settings(settings),
            state: Mutex::new(SessionState::new(conversation_id.into())),
            updates,
            joined: Notify::new(),
            subscriptions: Mutex::new(Vec::new()),
            typing_timer: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        install_handlers(&shared);

        let session = Self { shared };
        session.shared.state().history = HistoryPhase::Loading;

        let loader = session.clone();
        tokio::spawn(async move {
            // Failures are recorded in the session state.
            let _ = loader.load_history().await;
        });

        let weak = Arc::downgrade(&session.shared);
        let socket = session.shared.socket.clone();
        let token = session.shared.api.token().to_string();
        tokio::spawn(async move {
            if let Err(e) = socket.connect(&token).await {
                tracing::warn!("Chat connection failed: {}", e);
                if let Some(shared) = weak.upgrade() {
                    shared.record_error(&e);
                    schedule_reconnect(&shared);
                }
            }
        });

        session
    }

    pub fn conversation_id(&self) -> String {
        self.shared.conversation_id()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state();
        let mut typing: Vec<String> = state.typing.values().cloned().collect();
        typing.sort();
        let mut online: Vec<String> = state.online.iter().cloned().collect();
        online.sort();
        SessionSnapshot {
            conversation_id: state.conversation_id.clone(),
            history: state.history,
            connection: state.connection,
            messages: state.messages.to_vec(),
            has_more: state.next_page.is_some(),
            typing,
            online,
            last_error: state.last_error.clone(),
            reconnect_attempts: state.reconnect_attempts,
            exhausted: state.exhausted,
        }
    }

    /// Fetch the newest history page and merge it ahead of anything that
    /// arrived live. A result for a conversation that is no longer current is
    /// dropped. Failure still leaves history `Loaded`.
    pub async fn load_history(&self) -> ChatResult<usize> {
        let (generation, conversation_id) = {
            let mut state = self.shared.state();
            state.history = HistoryPhase::Loading;
            (state.generation, state.conversation_id.clone())
        };

        let result = chat::get_history(
            &self.shared.api,
            &conversation_id,
            1,
            self.shared.settings.history_page_size,
        )
        .await;

        let outcome = {
            let mut state = self.shared.state();
            if state.generation != generation {
                tracing::debug!("Discarding stale history for {}", conversation_id);
                return Ok(0);
            }
            state.history = HistoryPhase::Loaded;
            match result {
                Ok(page) => {
                    state.next_page = page
                        .has_more()
                        .then(|| page.pagination.page.max(1) + 1);
                    Ok(state.messages.prepend(page.messages))
                }
                Err(e) => {
                    state.last_error = Some(e.user_message());
                    Err(e)
                }
            }
        };

        match &outcome {
            Ok(count) => {
                tracing::debug!("Loaded {} messages for {}", count, conversation_id);
                self.shared
                    .notify(SessionUpdate::HistoryLoaded { count: *count });
            }
            Err(e) => {
                tracing::warn!("History load for {} failed: {}", conversation_id, e);
                self.shared.notify(SessionUpdate::Error(e.user_message()));
            }
        }
        outcome
    }

    /// Fetch the next older page, if any. Returns how many messages were new.
    pub async fn load_more(&self) -> ChatResult<usize> {
        let (generation, conversation_id, page) = {
            let state = self.shared.state();
            match state.next_page {
                Some(page) if state.history == HistoryPhase::Loaded => {
                    (state.generation, state.conversation_id.clone(), page)
                }
                _ => return Ok(0),
            }
        };

        let older = chat::get_history(
            &self.shared.api,
            &conversation_id,
            page,
            self.shared.settings.history_page_size,
        )
        .await
        .inspect_err(|e| self.shared.record_error(e))?;

        let count = {
            let mut state = self.shared.state();
            if state.generation != generation {
                return Ok(0);
            }
            state.next_page = older.has_more().then_some(page + 1);
            state.messages.prepend(older.messages)
        };
        self.shared.notify(SessionUpdate::OlderLoaded { count });
        Ok(count)
    }

    /// Load history only if it has never been loaded.
    pub async fn refresh(&self) -> ChatResult<()> {
        if self.shared.state().history != HistoryPhase::Idle {
            return Ok(());
        }
        self.load_history().await.map(|_| ())
    }

    /// Switch to another conversation. Local messages are dropped before the
    /// new history loads; pending loads for the old one are discarded.
    pub async fn set_conversation(&self, conversation_id: impl Into<String>) -> ChatResult<usize> {
        let conversation_id = conversation_id.into();
        let (previous, rejoin) = {
            let mut state = self.shared.state();
            if state.conversation_id == conversation_id {
                return Ok(0);
            }
            let previous = std::mem::replace(&mut state.conversation_id, conversation_id.clone());
            state.generation += 1;
            state.history = HistoryPhase::Loading;
            state.messages.clear();
            state.next_page = None;
            state.typing.clear();
            state.online.clear();
            state.last_error = None;
            if state.connection == ConnectionPhase::Joined {
                state.connection = ConnectionPhase::Connected;
            }
            (previous, state.connection == ConnectionPhase::Connected)
        };

        self.stop_typing_in(&previous);
        tracing::info!("Switched conversation {} -> {}", previous, conversation_id);
        self.shared
            .notify(SessionUpdate::ConversationChanged(conversation_id.clone()));

        if rejoin {
            if let Err(e) = self.shared.socket.join_conversation(&conversation_id) {
                tracing::debug!("Join of {} not sent: {}", conversation_id, e);
            }
        }
        self.load_history().await
    }

    /// Connect if needed, then join the conversation room. Waits up to
    /// `join_settle` for the server's acknowledgment and proceeds without it.
    async fn ensure_joined(&self) -> ChatResult<String> {
        let shared = &self.shared;
        let (conversation_id, phase) = {
            let state = shared.state();
            (state.conversation_id.clone(), state.connection)
        };
        if phase == ConnectionPhase::Joined && shared.socket.is_connected() {
            return Ok(conversation_id);
        }

        if !shared.socket.is_connected() {
            tracing::info!("Chat not connected, connecting before send");
            shared.socket.connect(shared.api.token()).await?;
        }

        let notified = shared.joined.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let already = {
            let state = shared.state();
            state.connection == ConnectionPhase::Joined && state.conversation_id == conversation_id
        };
        if already {
            return Ok(conversation_id);
        }

        shared.socket.join_conversation(&conversation_id)?;
        if time::timeout(shared.settings.join_settle(), notified)
            .await
            .is_err()
        {
            tracing::debug!(
                "No join acknowledgment for {} within {:?}, sending anyway",
                conversation_id,
                shared.settings.join_settle()
            );
        }
        Ok(conversation_id)
    }

    /// Send a text message. Connects and joins on demand. The message shows
    /// up in the list when the server echoes it back.
    pub async fn send_message(&self, text: &str) -> ChatResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let result = async {
            let conversation_id = self.ensure_joined().await?;
            self.shared
                .socket
                .send_message(&conversation_id, text, MessageType::Text, None)?;
            Ok::<_, ChatError>(conversation_id)
        }
        .await;

        match result {
            Ok(conversation_id) => {
                self.stop_typing_in(&conversation_id);
                Ok(())
            }
            Err(e) => {
                self.shared.record_error(&e);
                Err(e)
            }
        }
    }

    /// Send an image, preferring the socket and falling back to an HTTP
    /// upload when the socket path fails for any reason but validation.
    pub async fn send_image(&self, image: &ImageFile) -> ChatResult<Message> {
        if let Err(e) = image.validate() {
            let e = ChatError::from(e);
            self.shared.record_error(&e);
            return Err(e);
        }
        let conversation_id = self.conversation_id();

        let via_socket = match self.ensure_joined().await {
            Ok(joined) => self.shared.socket.send_image_message(&joined, image).await,
            Err(e) => Err(e),
        };

        let message = match via_socket {
            Ok(message) => message,
            Err(e @ ChatError::Validation(_)) => {
                self.shared.record_error(&e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Socket image send failed ({}), uploading over HTTP", e);
                chat::upload_image(&self.shared.api, &conversation_id, image)
                    .await
                    .inspect_err(|e| self.shared.record_error(e))?
            }
        };

        self.shared.admit(message.clone());
        Ok(message)
    }

    /// Report typing activity. `true` emits immediately and re-arms a timer
    /// that emits `false` after `typing_idle` without further calls.
    pub fn set_typing(&self, is_typing: bool) {
        let conversation_id = self.conversation_id();
        if !is_typing {
            self.stop_typing_in(&conversation_id);
            return;
        }

        if let Err(e) = self.shared.socket.set_typing(&conversation_id, true) {
            tracing::debug!("Typing indicator not sent: {}", e);
        }

        let socket = self.shared.socket.clone();
        let idle = self.shared.settings.typing_idle();
        let timer = tokio::spawn(async move {
            time::sleep(idle).await;
            if let Err(e) = socket.set_typing(&conversation_id, false) {
                tracing::debug!("Typing stop not sent: {}", e);
            }
        });
        if let Some(stale) = lock(&self.shared.typing_timer).replace(timer) {
            stale.abort();
        }
    }

    fn stop_typing_in(&self, conversation_id: &str) {
        let Some(timer) = self.shared.take_typing_timer() else {
            return;
        };
        if !timer.is_finished() {
            timer.abort();
            if let Err(e) = self.shared.socket.set_typing(conversation_id, false) {
                tracing::debug!("Typing stop not sent: {}", e);
            }
        }
    }

    /// Mark the conversation read: over the socket when connected, and always
    /// persisted over REST.
    pub async fn mark_as_read(&self, message_id: Option<&str>) -> ChatResult<()> {
        let conversation_id = self.conversation_id();
        if self.shared.socket.is_connected() {
            if let Err(e) = self.shared.socket.mark_as_read(&conversation_id, message_id) {
                tracing::debug!("mark-as-read not emitted: {}", e);
            }
        }
        chat::mark_read(&self.shared.api, &conversation_id)
            .await
            .inspect_err(|e| self.shared.record_error(e))
    }

    /// Delete the server-side history, then empty the local list. History
    /// stays `Loaded` so a refresh does not fetch it back, and a page still
    /// in flight is discarded when it lands.
    pub async fn clear_chat(&self) -> ChatResult<()> {
        let conversation_id = self.conversation_id();
        chat::clear_conversation(&self.shared.api, &conversation_id)
            .await
            .inspect_err(|e| self.shared.record_error(e))?;

        {
            let mut state = self.shared.state();
            if state.conversation_id != conversation_id {
                return Ok(());
            }
            state.generation += 1;
            state.messages.clear();
            state.next_page = None;
            state.history = HistoryPhase::Loaded;
        }
        self.shared.notify(SessionUpdate::Cleared);
        Ok(())
    }

    /// Soft-delete one message on the server and flag it locally.
    pub async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        chat::delete_message(&self.shared.api, message_id)
            .await
            .inspect_err(|e| self.shared.record_error(e))?;

        let updated = self.shared.state().messages.mark_deleted(message_id);
        if let Some(message) = updated {
            self.shared.notify(SessionUpdate::MessageUpdated(message));
        }
        Ok(())
    }

    /// Manual reconnect. Resets the automatic retry budget.
    pub async fn reconnect(&self) -> ChatResult<()> {
        if let Some(task) = lock(&self.shared.reconnect_task).take() {
            task.abort();
        }
        {
            let mut state = self.shared.state();
            state.reconnect_attempts = 0;
            state.exhausted = false;
            state.last_error = None;
        }
        self.ensure_joined()
            .await
            .map(|_| ())
            .inspect_err(|e| self.shared.record_error(e))
    }

    /// Stop listening and cancel timers. The shared socket stays up for
    /// other sessions.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conversation_id = self.conversation_id();
        self.stop_typing_in(&conversation_id);
        let subs = std::mem::take(&mut *lock(&self.shared.subscriptions));
        drop(subs);
        if let Some(task) = lock(&self.shared.reconnect_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{eventually, server_message, FakeServer};
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> ChatSettings {
        ChatSettings {
            connect_timeout_ms: 2_000,
            typing_idle_ms: 200,
            reconnect_base_ms: 50,
            reconnect_max_ms: 200,
            reconnect_max_attempts: 5,
            join_settle_ms: 300,
            image_ack_timeout_ms: 300,
            history_page_size: 50,
        }
    }

    fn page_json(conversation_id: &str, ids: &[&str], page: u32, pages: u32) -> serde_json::Value {
        let messages: Vec<_> = ids
            .iter()
            .map(|id| server_message(id, conversation_id, id))
            .collect();
        serde_json::json!({
            "success": true,
            "data": {
                "messages": messages,
                "pagination": {"page": page, "limit": 50, "total": ids.len(), "pages": pages}
            }
        })
    }

    async fn mount_history(api: &MockServer, conversation_id: &str, ids: &[&str]) {
        Mock::given(method("GET"))
            .and(path(format!("/chat/conversations/{}/messages", conversation_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json(conversation_id, ids, 1, 1)))
            .mount(api)
            .await;
    }

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn open(socket_url: &str, api: &MockServer, conversation_id: &str, settings: ChatSettings) -> ConversationSession {
        let socket = ChatSocket::new(socket_url, &settings);
        let api = ChatApi::new(&api.uri(), "tok").unwrap();
        ConversationSession::open(socket, api, &settings, conversation_id)
    }

    fn ids(session: &ConversationSession) -> Vec<String> {
        session.snapshot().messages.into_iter().map(|m| m.id).collect()
    }

    fn ready(session: &ConversationSession) -> bool {
        let snap = session.snapshot();
        snap.history == HistoryPhase::Loaded && snap.connection == ConnectionPhase::Joined
    }

    #[tokio::test]
    async fn test_history_and_live_messages_are_deduplicated() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        mount_history(&api, "c1", &["m1", "m2"]).await;
        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| ready(&session)).await);

        server.push("message-received", server_message("m2", "c1", "again"));
        server.push("message-received", server_message("m3", "c1", "new"));
        server.push(
            "image-message-received",
            serde_json::json!({ "message": server_message("m1", "c1", "dup") }),
        );
        server.push("message-received", server_message("x1", "other", "elsewhere"));
        server.push("message-received", server_message("m4", "c1", "last"));

        assert!(eventually(|| ids(&session).len() == 4).await);
        assert_eq!(ids(&session), vec!["m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_switching_conversation_discards_stale_history() {
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/A/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page_json("A", &["a1"], 1, 1))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&api)
            .await;
        mount_history(&api, "B", &["b1"]).await;

        let session = open(
            &closed_port_url().await,
            &api,
            "A",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.snapshot().history, HistoryPhase::Loading);

        assert_eq!(session.set_conversation("B").await.unwrap(), 1);
        // Let A's delayed response arrive.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let snap = session.snapshot();
        assert_eq!(snap.conversation_id, "B");
        assert_eq!(snap.history, HistoryPhase::Loaded);
        assert_eq!(ids(&session), vec!["b1"]);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_messages_and_rejoins_before_send() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        mount_history(&api, "c1", &["m1", "m2"]).await;
        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| ready(&session)).await);

        server.drop_connections();
        assert!(eventually(|| server.accepted() == 2 && ready(&session)).await);
        assert_eq!(ids(&session), vec!["m1", "m2"]);
        assert_eq!(session.snapshot().reconnect_attempts, 0);

        assert_ok!(session.send_message("Still there?").await);
        assert!(eventually(|| server.events_named("send-message").len() == 1).await);
        let names = server.event_names();
        let sent_at = names.iter().position(|n| n == "send-message").unwrap();
        let last_join = names.iter().rposition(|n| n == "join-conversation").unwrap();
        assert!(last_join < sent_at);
        assert!(server.events_named("join-conversation").len() >= 2);

        assert!(eventually(|| ids(&session).len() == 3).await);
        assert_eq!(ids(&session)[..2], ["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_clear_chat_keeps_history_loaded() {
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/c1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json("c1", &["m1"], 1, 1)))
            .expect(1)
            .mount(&api)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/chat/conversations/c1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .expect(1)
            .mount(&api)
            .await;

        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        assert!(eventually(|| ids(&session).len() == 1).await);

        assert_ok!(session.clear_chat().await);
        assert_ok!(session.refresh().await);

        let snap = session.snapshot();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.history, HistoryPhase::Loaded);
    }

    #[tokio::test]
    async fn test_clear_chat_discards_history_still_in_flight() {
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page_json("c1", &["m1"], 1, 1))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&api)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/chat/conversations/c1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&api)
            .await;

        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.snapshot().history, HistoryPhase::Loading);

        assert_ok!(session.clear_chat().await);
        assert!(ids(&session).is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let snap = session.snapshot();
        assert!(snap.messages.is_empty(), "{:?}", ids(&session));
        assert_eq!(snap.history, HistoryPhase::Loaded);
        assert!(!snap.has_more);
    }

    #[tokio::test]
    async fn test_typing_clears_itself_after_idle() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| ready(&session)).await);

        session.set_typing(true);
        session.set_typing(true);
        assert!(eventually(|| server.events_named("typing").len() == 3).await);

        let typing = server.events_named("typing");
        assert_eq!(typing[0]["isTyping"], true);
        assert_eq!(typing[1]["isTyping"], true);
        assert_eq!(typing[2]["isTyping"], false);
        assert_eq!(typing[2]["conversationId"], "c1");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.events_named("typing").len(), 3);
    }

    #[tokio::test]
    async fn test_image_falls_back_to_http_without_duplicates() {
        let server = FakeServer::start().await;
        server.set_behavior(|b| b.ack_images = false);
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let mut uploaded = server_message("img-1", "c1", "proof.png");
        uploaded["messageType"] = "image".into();
        Mock::given(method("POST"))
            .and(path("/chat/conversations/c1/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": true, "data": {"message": uploaded}}),
            ))
            .expect(1)
            .mount(&api)
            .await;

        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| ready(&session)).await);

        let image = ImageFile::new("proof.png", "image/png", vec![1, 2, 3]).unwrap();
        let message = session.send_image(&image).await.unwrap();
        assert_eq!(message.id, "img-1");
        assert_eq!(server.events_named("send-image-message").len(), 1);

        // The server broadcast of the same upload arrives later.
        server.push("image-message-received", server_message("img-1", "c1", "proof.png"));
        server.push("message-received", server_message("m9", "c1", "thanks"));
        assert!(eventually(|| ids(&session).len() == 2).await);
        assert_eq!(ids(&session), vec!["img-1", "m9"]);
    }

    #[tokio::test]
    async fn test_send_connects_on_demand_after_retries_stop() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let session = open(
            &server.url,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        assert!(eventually(|| ready(&session)).await);

        server.drop_connections();
        assert!(eventually(|| session.snapshot().exhausted).await);
        assert_eq!(session.snapshot().connection, ConnectionPhase::Disconnected);

        assert_ok!(session.send_message("hello again").await);
        assert_eq!(server.accepted(), 2);
        assert!(eventually(|| ids(&session).len() == 1).await);
        assert!(!session.snapshot().exhausted);
    }

    #[tokio::test]
    async fn test_failed_history_still_counts_as_loaded() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/c1/messages"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({"message": "database unavailable"})),
            )
            .mount(&api)
            .await;

        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| session.snapshot().history == HistoryPhase::Loaded).await);

        let snap = session.snapshot();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.last_error.as_deref(), Some("database unavailable"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_base_ms: 10,
                reconnect_max_ms: 20,
                reconnect_max_attempts: 3,
                ..settings()
            },
        );

        assert!(eventually(|| session.snapshot().exhausted).await);
        let snap = session.snapshot();
        assert_eq!(snap.reconnect_attempts, 3);
        assert_eq!(snap.connection, ConnectionPhase::Disconnected);
        assert!(!snap.is_reconnecting());
        assert!(snap.last_error.is_some());

        assert_err!(session.reconnect().await);
        assert!(!session.snapshot().exhausted);
    }

    #[tokio::test]
    async fn test_transport_teardown_stops_auto_reconnect() {
        let server = FakeServer::start().await;
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let session = open(&server.url, &api, "c1", settings());
        assert!(eventually(|| ready(&session)).await);

        session.shared.socket.disconnect();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(server.accepted(), 1);
        assert_eq!(session.snapshot().connection, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_load_more_prepends_older_page() {
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/c1/messages"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json("c1", &["m3", "m4"], 1, 2)))
            .mount(&api)
            .await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations/c1/messages"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json("c1", &["m1", "m2", "m3"], 2, 2)))
            .expect(1)
            .mount(&api)
            .await;

        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        assert!(eventually(|| session.snapshot().history == HistoryPhase::Loaded).await);
        assert!(session.snapshot().has_more);

        assert_eq!(session.load_more().await.unwrap(), 2);
        assert_eq!(ids(&session), vec!["m1", "m2", "m3", "m4"]);
        assert!(!session.snapshot().has_more);
        assert_eq!(session.load_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_message_flags_entry() {
        let api = MockServer::start().await;
        mount_history(&api, "c1", &["m1", "m2"]).await;
        Mock::given(method("DELETE"))
            .and(path("/chat/messages/m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .expect(1)
            .mount(&api)
            .await;

        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        assert!(eventually(|| ids(&session).len() == 2).await);

        let mut updates = session.subscribe_updates();
        assert_ok!(session.delete_message("m1").await);

        let updated = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SessionUpdate::MessageUpdated(m)) = updates.recv().await {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated.id, "m1");
        assert!(updated.is_deleted);
        assert!(session.snapshot().messages[0].is_deleted);
        assert!(!session.snapshot().messages[1].is_deleted);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_locally() {
        let api = MockServer::start().await;
        mount_history(&api, "c1", &[]).await;
        let session = open(
            &closed_port_url().await,
            &api,
            "c1",
            ChatSettings {
                reconnect_max_attempts: 0,
                ..settings()
            },
        );
        assert!(matches!(
            session.send_message("   ").await,
            Err(ChatError::EmptyMessage)
        ));
    }
}
