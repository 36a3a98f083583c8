use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use whatsapp_console_core::types::{ConnectionState, LocalId, MessageStatus};

pub use whatsapp_console_core::types::events::*;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Everything the console reports to the presentation layer.
#[derive(Debug, Clone)]
pub enum Event {
    /// A classified stream event, fired before it is applied to the stores.
    Gateway(Arc<GatewayEvent>),
    Connection(ConnectionState),
    /// The reconnect ceiling was reached; the stream stays down until the
    /// instance is selected again.
    ReconnectExhausted { attempts: u32 },
    /// The gateway confirmed the WhatsApp session is gone. The user has to
    /// pair the instance again.
    ReauthRequired { instance_id: String },
    MessageAppended { chat_id: String, local_id: LocalId },
    MessageStatusChanged {
        chat_id: String,
        local_id: LocalId,
        status: MessageStatus,
    },
    MessageFailed {
        chat_id: String,
        local_id: LocalId,
        error: String,
    },
    /// Several entries of a chat changed at once (history merge, echo fold).
    MessagesChanged { chat_id: String },
    RosterChanged,
    ProfileResolved { key: String },
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

/// Fans events out to registered handlers and broadcast subscribers.
///
/// Handlers run inline on the task that emits the event and must not block.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::default(),
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event: Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(&event);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}
