pub mod chat;
pub mod connection;
pub mod events;
pub mod message;
pub mod profile;

pub use chat::{Chat, ChatSummary};
pub use connection::{ConnectionState, GatewayConnectionStatus};
pub use events::{GatewayEvent, PresenceUpdate, StatusUpdate};
pub use message::{
    Direction, IncomingMessage, LocalId, MediaKind, MediaPayload, Message, MessageContent,
    MessageStatus, SentReceipt,
};
pub use profile::{FetchState, ProfileEntry, ProfileInfo};
