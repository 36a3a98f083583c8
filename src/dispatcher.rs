//! Routes classified stream events into the stores.

use crate::gateway::GatewayClient;
use crate::profile_cache::ProfileFetcher;
use crate::state::{ConsoleState, lock};
use crate::stream::StopHandle;
use crate::types::events::{Event, EventBus};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use whatsapp_console_core::jid;
use whatsapp_console_core::proto::{self, RawFrame};
use whatsapp_console_core::store::{AppendOutcome, StatusOutcome};
use whatsapp_console_core::types::{
    ChatSummary, GatewayConnectionStatus, GatewayEvent, IncomingMessage, StatusUpdate,
};

pub struct EventDispatcher {
    state: Arc<ConsoleState>,
    gateway: GatewayClient,
    fetcher: Arc<dyn ProfileFetcher>,
    /// Stops the stream session this dispatcher consumes.
    stop: StopHandle,
}

impl EventDispatcher {
    pub(crate) fn new(
        state: Arc<ConsoleState>,
        gateway: GatewayClient,
        stop: StopHandle,
    ) -> Self {
        let fetcher: Arc<dyn ProfileFetcher> = Arc::new(gateway.clone());
        Self {
            state,
            gateway,
            fetcher,
            stop,
        }
    }

    fn events(&self) -> &EventBus {
        &self.state.events
    }

    /// Consumes frames until the stream session ends. Background work started
    /// for this session (profile lookups, liveness checks) is abandoned when
    /// the loop exits.
    pub async fn run(self, mut frames: mpsc::Receiver<RawFrame>) {
        let mut tasks = JoinSet::new();
        while let Some(frame) = frames.recv().await {
            match proto::classify(&frame) {
                Ok(events) => {
                    for event in events {
                        self.dispatch(event, &mut tasks);
                    }
                }
                Err(e) => debug!(target: "Console/Dispatch", "Ignoring frame: {e}"),
            }
            while tasks.try_join_next().is_some() {}
        }
        debug!(target: "Console/Dispatch", "Frame channel closed, dispatcher exiting");
    }

    pub(crate) fn dispatch(&self, event: GatewayEvent, tasks: &mut JoinSet<()>) {
        self.events().dispatch(Event::Gateway(Arc::new(event.clone())));
        match event {
            GatewayEvent::MessageReceived(message) => self.on_message(*message, tasks),
            GatewayEvent::MessageUpdate(update) => self.on_status(update),
            GatewayEvent::ConnectionStatus(status) => self.on_connection_status(status, tasks),
            GatewayEvent::ChatsUpdate(chats) => self.on_chats(chats, tasks),
            // Presence carries no state; the event above is all there is.
            GatewayEvent::Presence(_) => {}
        }
    }

    fn on_message(&self, message: IncomingMessage, tasks: &mut JoinSet<()>) {
        let chat_id = message.chat_id.clone();
        let preview = message.content.preview_text();
        let timestamp = message.timestamp;
        let from_me = message.from_me;
        let profile_id = match (&message.sender, from_me) {
            (_, true) => None,
            (Some(sender), false) if jid::is_group(&chat_id) => Some(sender.clone()),
            _ => Some(chat_id.clone()),
        };

        let outcome = lock(&self.state.messages).append_inbound(message);
        match outcome {
            AppendOutcome::Inserted(local_id) => {
                {
                    let mut roster = lock(&self.state.roster);
                    let unread = roster
                        .get(&chat_id)
                        .and_then(|chat| chat.last_read_at)
                        .is_none_or(|read_at| timestamp > read_at);
                    let delta = u32::from(!from_me && unread);
                    roster.apply_increment(&chat_id, Some(preview), timestamp, delta);
                }
                self.events().dispatch(Event::MessageAppended {
                    chat_id: chat_id.clone(),
                    local_id,
                });
                self.events().dispatch(Event::RosterChanged);
            }
            AppendOutcome::StatusMerged { local_id, status } => {
                self.events().dispatch(Event::MessageStatusChanged {
                    chat_id: chat_id.clone(),
                    local_id,
                    status,
                });
            }
            AppendOutcome::Duplicate(local_id) => {
                debug!(target: "Console/Dispatch", "Duplicate delivery of {local_id} in {chat_id}");
            }
        }

        if let Some(id) = profile_id {
            self.state.spawn_profile_lookup(tasks, &self.fetcher, &id);
        }
    }

    fn on_status(&self, update: StatusUpdate) {
        let outcome = lock(&self.state.messages).apply_status_update(&update.server_id, update.status);
        match outcome {
            StatusOutcome::Applied {
                local_id,
                chat_id,
                status,
            } => self.events().dispatch(Event::MessageStatusChanged {
                chat_id,
                local_id,
                status,
            }),
            StatusOutcome::Regressed { local_id, current } => debug!(
                target: "Console/Dispatch",
                "Ignoring stale {} for {local_id}, already {current}", update.status
            ),
            other => debug!(target: "Console/Dispatch", "Status for {}: {other:?}", update.server_id),
        }
    }

    fn on_connection_status(&self, status: GatewayConnectionStatus, tasks: &mut JoinSet<()>) {
        info!(target: "Console/Dispatch", "Gateway reports instance {status:?}, checking liveness");
        let gateway = self.gateway.clone();
        let events = self.events().clone();
        let stop = self.stop.clone();
        tasks.spawn(async move {
            let instance_id = gateway.credentials().instance_id.clone();
            let gone = match gateway.instance_connected().await {
                Ok(connected) => !connected,
                Err(e) if e.is_unauthorized() => true,
                Err(e) => {
                    warn!(target: "Console/Dispatch", "Liveness check failed: {e}");
                    false
                }
            };
            if gone {
                warn!(target: "Console/Dispatch", "Instance {instance_id} is no longer connected, re-pairing required");
                events.dispatch(Event::ReauthRequired { instance_id });
                stop.stop();
            }
        });
    }

    fn on_chats(&self, chats: Vec<ChatSummary>, tasks: &mut JoinSet<()>) {
        let changed = lock(&self.state.roster).merge_snapshot(chats);
        if changed.is_empty() {
            return;
        }
        self.events().dispatch(Event::RosterChanged);
        let unnamed: Vec<String> = {
            let roster = lock(&self.state.roster);
            changed
                .into_iter()
                .filter(|id| roster.get(id).is_some_and(|c| c.display_name.is_none()))
                .collect()
        };
        for id in unnamed {
            self.state.spawn_profile_lookup(tasks, &self.fetcher, &id);
        }
    }
}
