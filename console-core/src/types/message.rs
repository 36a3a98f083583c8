use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-generated identity of a message entry.
///
/// Every entry gets one, including inbound messages, so that ties on the
/// timestamp order deterministically. Ids are handed out in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by the connected instance.
    Outbound,
    Inbound,
}

/// Delivery state of an outbound message.
///
/// Progresses `Sending → Sent → Delivered → Read`. `Failed` is terminal and
/// only reachable from `Sending` or `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the delivery ladder. `Failed` is off the ladder.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` keeps status monotonic.
    /// Staying on the same status counts as allowed.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => next == Self::Failed,
            (Some(current), None) => current <= 1,
            (Some(current), Some(next)) => next >= current,
        }
    }

    /// The further along of two statuses, used when merging duplicate reports.
    pub fn merge(self, other: MessageStatus) -> MessageStatus {
        if self.can_advance_to(other) { other } else { self }
    }

    /// Parses the status names used by gateways: ack constants
    /// (`SERVER_ACK`, `DELIVERY_ACK`, ...), plain words, or numeric acks.
    pub fn from_wire(value: &str) -> Option<Self> {
        let status = match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "sending" | "1" => Self::Sending,
            "server_ack" | "sent" | "2" => Self::Sent,
            "delivery_ack" | "delivered" | "3" => Self::Delivered,
            "read" | "read_ack" | "played" | "4" | "5" => Self::Read,
            "error" | "failed" | "0" => Self::Failed,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Sticker,
    Contact,
    None,
}

impl MediaKind {
    /// Parses the `messageType` names gateways report.
    pub fn from_wire(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        let value = value.strip_suffix("message").unwrap_or(&value);
        match value {
            "text" | "conversation" | "extendedtext" | "chat" => Self::Text,
            "image" => Self::Image,
            "video" | "ptv" => Self::Video,
            "audio" | "ptt" | "voice" => Self::Audio,
            "document" | "documentwithcaption" => Self::Document,
            "location" | "livelocation" => Self::Location,
            "sticker" => Self::Sticker,
            "contact" | "contacts" | "contactsarray" | "vcard" => Self::Contact,
            _ => Self::None,
        }
    }

    /// Name used by the gateway's send endpoints.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Location => "location",
            Self::Sticker => "sticker",
            Self::Contact => "contact",
            Self::None => "none",
        }
    }

    /// Get a display label for chat list preview
    pub fn display_label(self) -> &'static str {
        match self {
            Self::Text => "",
            Self::Image => "📷 Photo",
            Self::Video => "🎥 Video",
            Self::Audio => "🎤 Voice message",
            Self::Document => "📄 Document",
            Self::Location => "📍 Location",
            Self::Sticker => "🎭 Sticker",
            Self::Contact => "👤 Contact",
            Self::None => "Message",
        }
    }
}

/// Message content, classified once when the message is ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        url: Option<String>,
        caption: Option<String>,
    },
    Video {
        url: Option<String>,
        caption: Option<String>,
    },
    Audio {
        url: Option<String>,
        voice_note: bool,
    },
    Document {
        url: Option<String>,
        file_name: Option<String>,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    Sticker {
        url: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: Option<String>,
    },
    /// Content the gateway reported without a recognised shape.
    Empty,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Text { .. } => MediaKind::Text,
            Self::Image { .. } => MediaKind::Image,
            Self::Video { .. } => MediaKind::Video,
            Self::Audio { .. } => MediaKind::Audio,
            Self::Document { .. } => MediaKind::Document,
            Self::Location { .. } => MediaKind::Location,
            Self::Sticker { .. } => MediaKind::Sticker,
            Self::Contact { .. } => MediaKind::Contact,
            Self::Empty => MediaKind::None,
        }
    }

    /// Caption or body text, if the variant carries any.
    pub fn caption(&self) -> Option<&str> {
        let text = match self {
            Self::Text { body } => Some(body.as_str()),
            Self::Image { caption, .. }
            | Self::Video { caption, .. }
            | Self::Document { caption, .. } => caption.as_deref(),
            Self::Location { name, .. } => name.as_deref(),
            Self::Contact { display_name, .. } => Some(display_name.as_str()),
            Self::Audio { .. } | Self::Sticker { .. } | Self::Empty => None,
        };
        text.filter(|t| !t.is_empty())
    }

    /// Get the preview text for chat list display.
    ///
    /// Text messages preview as their body; everything else as
    /// "<label> <caption>" or just the label.
    pub fn preview_text(&self) -> String {
        match (self, self.caption()) {
            (Self::Text { body }, _) => body.clone(),
            (other, Some(caption)) => format!("{} {}", other.kind().display_label(), caption),
            (other, None) => other.kind().display_label().to_string(),
        }
    }
}

/// Media attachment for an outgoing message, sent by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub url: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

impl MediaPayload {
    /// Builds the message content for this attachment. Only URL-backed media
    /// kinds qualify; anything else is handed back unchanged.
    pub fn into_content(self) -> Result<MessageContent, MediaPayload> {
        let url = Some(self.url.clone());
        let content = match self.kind {
            MediaKind::Image => MessageContent::Image {
                url,
                caption: self.caption.clone(),
            },
            MediaKind::Video => MessageContent::Video {
                url,
                caption: self.caption.clone(),
            },
            MediaKind::Audio => MessageContent::Audio {
                url,
                voice_note: false,
            },
            MediaKind::Document => MessageContent::Document {
                url,
                file_name: self.file_name.clone(),
                caption: self.caption.clone(),
            },
            MediaKind::Sticker => MessageContent::Sticker { url },
            _ => return Err(self),
        };
        Ok(content)
    }
}

/// A message entry in a chat's ordered log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub local_id: LocalId,
    /// Gateway-assigned id. Set once on reconcile or ingestion, then immutable.
    pub server_id: Option<String>,
    pub chat_id: String,
    pub direction: Direction,
    /// Sender id (for group chats), when the gateway reports it.
    pub sender: Option<String>,
    /// Sender's push name, when the gateway reports it.
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub status: MessageStatus,
    /// Server time once known, client time before that.
    pub timestamp: DateTime<Utc>,
    /// Ordering timestamp, fixed when the entry is inserted.
    pub ordered_at: DateTime<Utc>,
}

impl Message {
    pub fn media_kind(&self) -> MediaKind {
        self.content.kind()
    }

    /// Position key within the chat: `(timestamp, local id)`.
    pub fn sort_key(&self) -> (DateTime<Utc>, LocalId) {
        (self.ordered_at, self.local_id)
    }
}

/// A message as reported by the gateway, either pushed over the stream or
/// returned by a history fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingMessage {
    pub chat_id: String,
    pub server_id: String,
    pub from_me: bool,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    /// Delivery status, only meaningful when `from_me`.
    pub status: Option<MessageStatus>,
}

/// Result of a successful send call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentReceipt {
    pub server_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}
