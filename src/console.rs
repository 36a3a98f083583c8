//! The chat console facade consumed by the presentation layer.

use crate::config::{ClientConfig, InstanceCredentials};
use crate::dispatcher::EventDispatcher;
use crate::error::{ConsoleError, GatewayError};
use crate::gateway::GatewayClient;
use crate::profile_cache::ProfileFetcher;
use crate::state::{ConsoleState, lock};
use crate::stream::StreamConnectionManager;
use crate::types::events::{Event, EventHandler};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use whatsapp_console_core::net::{EventStreamFactory, HttpClient};
use whatsapp_console_core::types::{
    Chat, ConnectionState, LocalId, MediaPayload, Message, MessageContent, MessageStatus,
    ProfileEntry,
};

struct Session {
    gateway: GatewayClient,
    dispatcher: JoinHandle<()>,
    /// Send, resync and lookup tasks started by console actions.
    tasks: JoinSet<()>,
}

/// Real-time chat console over one gateway instance at a time.
///
/// Views are plain reads of the stores. Actions return as soon as local state
/// is updated; network work runs in tasks owned by the current instance
/// session and is abandoned when the instance changes or the console closes.
pub struct ChatConsole {
    config: ClientConfig,
    http: Arc<dyn HttpClient>,
    state: Arc<ConsoleState>,
    stream: Arc<StreamConnectionManager>,
    session: Mutex<Option<Session>>,
}

impl ChatConsole {
    pub fn new(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        stream_factory: Arc<dyn EventStreamFactory>,
    ) -> Self {
        let state = Arc::new(ConsoleState::new(
            config.pending_status_capacity,
            Default::default(),
        ));
        let stream = Arc::new(StreamConnectionManager::new(
            stream_factory,
            config.reconnect.clone(),
            config.event_channel_capacity,
            state.events.clone(),
        )
        .with_idle_timeout(config.stream_idle_timeout));
        Self {
            config,
            http,
            state,
            stream,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn on_event(&self, handler: Arc<dyn EventHandler>) {
        self.state.events.add_handler(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.state.events.subscribe()
    }

    /// Switches the console to `credentials`' instance. The previous session
    /// is closed first and its chats, messages and profiles are discarded.
    pub async fn select_instance(&self, credentials: InstanceCredentials) {
        let mut session = self.session.lock().await;
        self.teardown(session.take()).await;

        info!(target: "Console", "Selecting instance {}", credentials.instance_id);
        let instance_id = credentials.instance_id.clone();
        let gateway = GatewayClient::new(self.http.clone(), &self.config.base_url, credentials);
        let (frames, stop) = self
            .stream
            .connect(&instance_id, gateway.stream_request())
            .await;
        let dispatcher = EventDispatcher::new(self.state.clone(), gateway.clone(), stop);
        *session = Some(Session {
            gateway,
            dispatcher: tokio::spawn(dispatcher.run(frames)),
            tasks: JoinSet::new(),
        });
    }

    /// Closes the current session, if any, and discards its state.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        self.teardown(session.take()).await;
    }

    async fn teardown(&self, session: Option<Session>) {
        let Some(mut session) = session else {
            return;
        };
        info!(
            target: "Console",
            "Closing instance {}", session.gateway.credentials().instance_id
        );
        self.stream.disconnect().await;
        session.dispatcher.abort();
        session.tasks.abort_all();
        self.state.clear();
        self.state.events.dispatch(Event::RosterChanged);
    }

    async fn gateway(&self) -> Result<GatewayClient, ConsoleError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.gateway.clone())
            .ok_or(ConsoleError::NoInstance)
    }

    async fn spawn_task<F>(&self, task: F) -> Result<(), ConsoleError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(ConsoleError::NoInstance)?;
        while session.tasks.try_join_next().is_some() {}
        session.tasks.spawn(task);
        Ok(())
    }

    pub async fn send_text(
        &self,
        chat_id: &str,
        text: impl Into<String>,
    ) -> Result<LocalId, ConsoleError> {
        self.send_content(chat_id, MessageContent::text(text)).await
    }

    pub async fn send_media(
        &self,
        chat_id: &str,
        payload: MediaPayload,
    ) -> Result<LocalId, ConsoleError> {
        let content = payload.into_content().map_err(|payload| {
            ConsoleError::InvalidMedia(format!("{:?} is not a media kind", payload.kind))
        })?;
        self.send_content(chat_id, content).await
    }

    pub async fn send_location(
        &self,
        chat_id: &str,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    ) -> Result<LocalId, ConsoleError> {
        let content = MessageContent::Location {
            latitude,
            longitude,
            name,
        };
        self.send_content(chat_id, content).await
    }

    pub async fn send_contact(
        &self,
        chat_id: &str,
        display_name: impl Into<String>,
        vcard: Option<String>,
    ) -> Result<LocalId, ConsoleError> {
        let content = MessageContent::Contact {
            display_name: display_name.into(),
            vcard,
        };
        self.send_content(chat_id, content).await
    }

    /// Appends `content` optimistically and sends it in the background.
    /// The returned local id stays valid whatever the send outcome.
    pub async fn send_content(
        &self,
        chat_id: &str,
        content: MessageContent,
    ) -> Result<LocalId, ConsoleError> {
        let blank = match &content {
            MessageContent::Empty => true,
            MessageContent::Text { body } => body.trim().is_empty(),
            _ => false,
        };
        if blank {
            return Err(ConsoleError::EmptyMessage);
        }
        let gateway = self.gateway().await?;
        let preview = content.preview_text();
        let local_id = lock(&self.state.messages).append_optimistic(chat_id, content.clone());
        lock(&self.state.roster).apply_increment(chat_id, Some(preview), Utc::now(), 0);
        self.state.events.dispatch(Event::MessageAppended {
            chat_id: chat_id.to_string(),
            local_id,
        });
        self.state.events.dispatch(Event::RosterChanged);

        self.spawn_delivery(gateway, local_id, chat_id.to_string(), content)
            .await?;
        Ok(local_id)
    }

    /// Sends a failed message again under the same local id.
    pub async fn retry_failed(&self, local_id: LocalId) -> Result<(), ConsoleError> {
        let gateway = self.gateway().await?;
        let (chat_id, content) = lock(&self.state.messages).begin_retry(local_id)?;
        info!(target: "Console/Send", "Retrying {local_id} in {chat_id}");
        self.state.events.dispatch(Event::MessageStatusChanged {
            chat_id: chat_id.clone(),
            local_id,
            status: MessageStatus::Sending,
        });
        self.spawn_delivery(gateway, local_id, chat_id, content).await
    }

    async fn spawn_delivery(
        &self,
        gateway: GatewayClient,
        local_id: LocalId,
        chat_id: String,
        content: MessageContent,
    ) -> Result<(), ConsoleError> {
        let delivery = Delivery {
            state: self.state.clone(),
            gateway,
            send_timeout: self.config.send_timeout,
            resync: self.config.post_send_resync,
            history_page_size: self.config.history_page_size,
        };
        let spawned = self
            .spawn_task(delivery.run(local_id, chat_id.clone(), content))
            .await;
        if spawned.is_err() && lock(&self.state.messages).fail(local_id).unwrap_or(false) {
            self.state.events.dispatch(Event::MessageFailed {
                chat_id,
                local_id,
                error: ConsoleError::NoInstance.to_string(),
            });
        }
        spawned
    }

    /// Fetches the full chat list and merges it into the roster.
    /// Returns how many chats changed.
    pub async fn load_snapshot(&self) -> Result<usize, ConsoleError> {
        let gateway = self.gateway().await?;
        let chats = gateway.find_chats().await?;
        let changed = lock(&self.state.roster).merge_snapshot(chats);
        debug!(target: "Console", "Snapshot changed {} chats", changed.len());
        if !changed.is_empty() {
            self.state.events.dispatch(Event::RosterChanged);
        }
        Ok(changed.len())
    }

    /// Makes `chat_id` the open chat: loads its recent history and marks it
    /// read. Returns how many messages the history load added or updated.
    pub async fn open_chat(&self, chat_id: &str) -> Result<usize, ConsoleError> {
        let gateway = self.gateway().await?;
        lock(&self.state.roster).set_active(Some(chat_id));

        let history = gateway
            .find_messages(chat_id, self.config.history_page_size)
            .await?;
        let changed = merge_history(&self.state, chat_id, history);

        let fetcher: Arc<dyn ProfileFetcher> = Arc::new(gateway);
        let lookup_state = self.state.clone();
        let lookup_id = chat_id.to_string();
        // Opening a chat is an explicit request, so failed lookups retry here.
        self.spawn_task(async move {
            lookup_state.resolve_profile(&fetcher, &lookup_id).await;
        })
        .await?;

        self.mark_read(chat_id).await?;
        Ok(changed)
    }

    /// Clears the open chat; new messages count as unread again.
    pub fn close_chat(&self) {
        lock(&self.state.roster).set_active(None);
    }

    /// Resets the chat's unread count and tells the gateway. The local reset
    /// stands even if the gateway call fails.
    pub async fn mark_read(&self, chat_id: &str) -> Result<(), ConsoleError> {
        let gateway = self.gateway().await?;
        if lock(&self.state.roster).mark_read(chat_id) {
            self.state.events.dispatch(Event::RosterChanged);
        }
        if let Err(e) = gateway.mark_read(chat_id).await {
            warn!(target: "Console", "Failed to mark {chat_id} read at the gateway: {e}");
        }
        Ok(())
    }

    /// Resolves a profile now, fetching it if needed.
    pub async fn resolve_profile(&self, id: &str) -> Result<ProfileEntry, ConsoleError> {
        let fetcher: Arc<dyn ProfileFetcher> = Arc::new(self.gateway().await?);
        Ok(self.state.resolve_profile(&fetcher, id).await)
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        lock(&self.state.messages).messages(chat_id).to_vec()
    }

    pub fn message(&self, local_id: LocalId) -> Option<Message> {
        lock(&self.state.messages).get(local_id).cloned()
    }

    pub fn roster(&self) -> Vec<Chat> {
        lock(&self.state.roster).ordered()
    }

    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        lock(&self.state.roster).get(chat_id).cloned()
    }

    /// Cached profile for `id`; never fetches.
    pub fn profile(&self, id: &str) -> ProfileEntry {
        self.state.profiles.lookup(id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.stream.watch_state()
    }

    /// Instance whose stream is currently running.
    pub fn active_instance(&self) -> Option<String> {
        self.stream.instance_id()
    }
}

impl Drop for ChatConsole {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.dispatcher.abort();
        }
        self.stream.shutdown();
    }
}

fn merge_history(
    state: &ConsoleState,
    chat_id: &str,
    history: Vec<whatsapp_console_core::types::IncomingMessage>,
) -> usize {
    let (changed, last) = {
        let mut messages = lock(&state.messages);
        let changed = messages.merge_history(history);
        let last = messages
            .last_message(chat_id)
            .map(|m| (m.content.preview_text(), m.timestamp));
        (changed, last)
    };
    if changed == 0 {
        return 0;
    }
    if let Some((preview, timestamp)) = last {
        lock(&state.roster).apply_increment(chat_id, Some(preview), timestamp, 0);
    }
    state.events.dispatch(Event::MessagesChanged {
        chat_id: chat_id.to_string(),
    });
    state.events.dispatch(Event::RosterChanged);
    changed
}

/// One send attempt for an optimistic entry.
struct Delivery {
    state: Arc<ConsoleState>,
    gateway: GatewayClient,
    send_timeout: Duration,
    resync: Option<Duration>,
    history_page_size: u32,
}

impl Delivery {
    async fn run(self, local_id: LocalId, chat_id: String, content: MessageContent) {
        let sent = match tokio::time::timeout(
            self.send_timeout,
            self.gateway.send(&chat_id, &content),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.send_timeout)),
        };

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(target: "Console/Send", "Send of {local_id} to {chat_id} failed: {e}");
                if lock(&self.state.messages).fail(local_id).unwrap_or(false) {
                    self.state.events.dispatch(Event::MessageFailed {
                        chat_id,
                        local_id,
                        error: e.to_string(),
                    });
                }
                return;
            }
        };

        let reconciled = lock(&self.state.messages).reconcile(
            local_id,
            &receipt.server_id,
            receipt.timestamp,
            receipt.status,
        );
        match reconciled {
            Ok(reconciled) => {
                debug!(
                    target: "Console/Send",
                    "{local_id} reconciled as {} ({})", receipt.server_id, reconciled.status
                );
                if reconciled.absorbed.is_some() {
                    self.state.events.dispatch(Event::MessagesChanged {
                        chat_id: chat_id.clone(),
                    });
                }
                self.state.events.dispatch(Event::MessageStatusChanged {
                    chat_id: chat_id.clone(),
                    local_id,
                    status: reconciled.status,
                });
            }
            Err(e) => warn!(target: "Console/Send", "Could not reconcile {local_id}: {e}"),
        }

        if let Some(delay) = self.resync {
            tokio::time::sleep(delay).await;
            match self
                .gateway
                .find_messages(&chat_id, self.history_page_size)
                .await
            {
                Ok(history) => {
                    merge_history(&self.state, &chat_id, history);
                }
                Err(e) => debug!(target: "Console/Send", "Post-send resync of {chat_id} failed: {e}"),
            }
        }
    }
}
