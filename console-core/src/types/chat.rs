use crate::jid;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A chat/conversation as shown in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chat {
    /// Remote chat id - unique identifier
    pub id: String,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Derived from the id suffix when the chat is created.
    pub is_group: bool,
    /// Newest message time covered by an explicit mark-read.
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Chat {
    /// Create a new chat from its id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let is_group = jid::is_group(&id);
        Self {
            id,
            display_name: None,
            profile_image_url: None,
            last_message_preview: None,
            last_message_timestamp: None,
            unread_count: 0,
            is_group,
            last_read_at: None,
        }
    }

    /// Name to render: the resolved display name, or one derived from the id.
    pub fn title(&self) -> String {
        self.display_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| jid::placeholder_name(&self.id))
    }
}

/// Chat fields as reported by the gateway, from a bulk snapshot or a
/// `chats` stream frame. Absent fields leave the roster untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread_count: Option<u32>,
}
