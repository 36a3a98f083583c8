use super::chat::ChatSummary;
use super::connection::GatewayConnectionStatus;
use super::message::{IncomingMessage, MessageStatus};
use serde::Serialize;

/// Status change for a message the gateway already assigned an id to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub server_id: String,
    pub chat_id: Option<String>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceUpdate {
    pub chat_id: String,
    /// Raw presence name, e.g. `composing`, `available`.
    pub presence: String,
}

/// A decoded and classified stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GatewayEvent {
    MessageReceived(Box<IncomingMessage>),
    MessageUpdate(StatusUpdate),
    ConnectionStatus(GatewayConnectionStatus),
    ChatsUpdate(Vec<ChatSummary>),
    Presence(PresenceUpdate),
}
