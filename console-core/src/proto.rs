//! Gateway wire formats: stream frames, send bodies and REST responses.
//!
//! Gateways disagree on field names (`chatid` vs `key.remoteJid`, ack
//! constants vs plain words), so lookups try a short list of known paths and
//! take the first non-empty value. Content is classified here, once.

use crate::types::{
    ChatSummary, GatewayConnectionStatus, GatewayEvent, IncomingMessage, MediaKind,
    MessageContent, MessageStatus, PresenceUpdate, ProfileInfo, SentReceipt, StatusUpdate,
};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Event names requested when opening the stream.
pub const STREAM_EVENTS: [&str; 4] = ["messages", "messages_update", "chats", "presence"];

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no recognised type (type={kind:?}, event={event:?})")]
    Unclassified {
        kind: Option<String>,
        event: Option<String>,
    },
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message status `{0}`")]
    UnknownStatus(String),
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("{0:?} content cannot be sent")]
    Unsendable(MediaKind),
    #[error("gateway rejected the message: {0}")]
    Rejected(String),
}

/// One decoded stream frame, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Messages,
    MessagesUpdate,
    Connection,
    Chats,
    Presence,
}

impl FrameKind {
    fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase().replace(['.', '-'], "_");
        let kind = match name.as_str() {
            "messages" | "message" | "messages_upsert" | "message_received" => Self::Messages,
            "messages_update" | "message_update" | "message_ack" | "messages_ack" => {
                Self::MessagesUpdate
            }
            "connection" | "connection_update" | "connection_status" => Self::Connection,
            "chats" | "chats_upsert" | "chats_update" | "chat_update" => Self::Chats,
            "presence" | "presence_update" | "chat_presence" => Self::Presence,
            _ => return None,
        };
        Some(kind)
    }
}

pub fn parse_frame(bytes: &[u8]) -> Result<RawFrame, ProtoError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Classifies a frame into gateway events. A frame whose `data` is an array
/// may yield several events.
pub fn classify(frame: &RawFrame) -> Result<Vec<GatewayEvent>, ProtoError> {
    let kind = [frame.kind.as_deref(), frame.event.as_deref()]
        .into_iter()
        .flatten()
        .find_map(FrameKind::from_name)
        .ok_or_else(|| ProtoError::Unclassified {
            kind: frame.kind.clone(),
            event: frame.event.clone(),
        })?;

    match kind {
        FrameKind::Messages => collect_items(&frame.data, |item| {
            parse_message(item, None).map(|m| vec![GatewayEvent::MessageReceived(Box::new(m))])
        }),
        FrameKind::MessagesUpdate => collect_items(&frame.data, |item| {
            parse_status_updates(item)
                .map(|updates| updates.into_iter().map(GatewayEvent::MessageUpdate).collect())
        }),
        FrameKind::Connection => {
            parse_connection_status(&frame.data).map(|s| vec![GatewayEvent::ConnectionStatus(s)])
        }
        FrameKind::Chats => collect_items(&frame.data, |item| {
            parse_chat(item).map(|c| vec![GatewayEvent::ChatsUpdate(vec![c])])
        }),
        FrameKind::Presence => collect_items(&frame.data, |item| {
            parse_presence(item).map(|p| vec![GatewayEvent::Presence(p)])
        }),
    }
}

pub fn decode_events(bytes: &[u8]) -> Result<Vec<GatewayEvent>, ProtoError> {
    classify(&parse_frame(bytes)?)
}

/// Applies `parse` to `data`, or to each element when `data` is an array.
/// Bad elements are skipped unless nothing could be parsed.
fn collect_items<F>(data: &Value, mut parse: F) -> Result<Vec<GatewayEvent>, ProtoError>
where
    F: FnMut(&Value) -> Result<Vec<GatewayEvent>, ProtoError>,
{
    let Some(items) = data.as_array() else {
        return parse(data);
    };
    let mut events = Vec::new();
    let mut first_error = None;
    for item in items {
        match parse(item) {
            Ok(mut parsed) => events.append(&mut parsed),
            Err(e) => {
                debug!("Skipping malformed frame element: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if events.is_empty() => Err(e),
        _ => Ok(events),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(key),
    })
}

/// First non-empty string (or number, stringified) found at any of `paths`.
fn str_at(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn bool_at(value: &Value, paths: &[&str]) -> Option<bool> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn f64_at(value: &Value, paths: &[&str]) -> Option<f64> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn u32_at(value: &Value, paths: &[&str]) -> Option<u32> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::Number(n) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

/// Parses unix seconds, unix milliseconds or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                return DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
        },
        _ => return None,
    };
    if raw <= 0 {
        return None;
    }
    if raw >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

fn timestamp_at(value: &Value, paths: &[&str]) -> Option<DateTime<Utc>> {
    paths
        .iter()
        .find_map(|path| lookup(value, path).and_then(parse_timestamp))
}

fn content_of(data: &Value) -> MessageContent {
    let text = str_at(
        data,
        &[
            "text",
            "body",
            "content",
            "content.text",
            "message.conversation",
            "message.extendedTextMessage.text",
        ],
    );
    let caption = str_at(data, &["caption", "content.caption"]).or_else(|| text.clone());
    let url = str_at(
        data,
        &["url", "mediaUrl", "fileURL", "fileUrl", "content.URL", "content.url"],
    );
    let hinted = str_at(data, &["messageType", "mediaType", "message_type"])
        .map(|name| MediaKind::from_wire(&name))
        .filter(|kind| *kind != MediaKind::None);
    let kind = hinted.unwrap_or(if text.is_some() {
        MediaKind::Text
    } else {
        MediaKind::None
    });

    match kind {
        MediaKind::Text => text.map_or(MessageContent::Empty, |body| MessageContent::Text { body }),
        MediaKind::Image => MessageContent::Image { url, caption },
        MediaKind::Video => MessageContent::Video { url, caption },
        MediaKind::Audio => MessageContent::Audio {
            url,
            voice_note: bool_at(data, &["ptt", "content.PTT"]).unwrap_or(false),
        },
        MediaKind::Document => MessageContent::Document {
            url,
            file_name: str_at(data, &["fileName", "filename", "docName", "content.fileName"]),
            caption,
        },
        MediaKind::Sticker => MessageContent::Sticker { url },
        MediaKind::Location => {
            let latitude = f64_at(data, &["latitude", "degreesLatitude", "content.degreesLatitude"]);
            let longitude =
                f64_at(data, &["longitude", "degreesLongitude", "content.degreesLongitude"]);
            match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => MessageContent::Location {
                    latitude,
                    longitude,
                    name: str_at(data, &["locationName", "name", "content.name"]),
                },
                _ => text.map_or(MessageContent::Empty, |body| MessageContent::Text { body }),
            }
        }
        MediaKind::Contact => MessageContent::Contact {
            display_name: str_at(data, &["displayName", "contactName", "fullName"])
                .or(text)
                .unwrap_or_default(),
            vcard: str_at(data, &["vcard", "content.vcard"]),
        },
        MediaKind::None => MessageContent::Empty,
    }
}

/// Parses one message object. `fallback_chat` fills in the chat id for
/// history pages, whose items may omit it.
pub fn parse_message(
    data: &Value,
    fallback_chat: Option<&str>,
) -> Result<IncomingMessage, ProtoError> {
    let chat_id = str_at(data, &["chatid", "chatId", "chat_id", "key.remoteJid", "remoteJid"])
        .or_else(|| fallback_chat.map(str::to_string))
        .ok_or(ProtoError::MissingField("chatid"))?;
    let server_id = str_at(data, &["messageid", "messageId", "key.id", "id"])
        .ok_or(ProtoError::MissingField("messageid"))?;
    let from_me = bool_at(data, &["fromMe", "key.fromMe", "from_me"]).unwrap_or(false);
    let timestamp = timestamp_at(data, &["messageTimestamp", "timestamp", "t"])
        .unwrap_or_else(Utc::now);
    let status = str_at(data, &["status", "ack"]).and_then(|s| MessageStatus::from_wire(&s));

    Ok(IncomingMessage {
        chat_id,
        server_id,
        from_me,
        sender: str_at(data, &["sender", "participant", "key.participant", "author"]),
        sender_name: str_at(data, &["senderName", "pushName", "notifyName"]),
        content: content_of(data),
        timestamp,
        status,
    })
}

/// Parses a status frame element. One element may acknowledge several ids.
pub fn parse_status_updates(data: &Value) -> Result<Vec<StatusUpdate>, ProtoError> {
    let raw_status = str_at(data, &["status", "update.status", "state", "Type", "type", "ack"])
        .ok_or(ProtoError::MissingField("status"))?;
    let status = MessageStatus::from_wire(&raw_status)
        .ok_or_else(|| ProtoError::UnknownStatus(raw_status.clone()))?;
    let chat_id = str_at(data, &["chatid", "chatId", "key.remoteJid", "remoteJid", "Chat"]);

    let ids: Vec<String> = match ["MessageIDs", "messageIds", "ids"]
        .iter()
        .find_map(|path| lookup(data, path).and_then(Value::as_array))
    {
        Some(ids) => ids
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect(),
        None => str_at(data, &["messageid", "messageId", "key.id", "keyId", "id"])
            .into_iter()
            .collect(),
    };
    if ids.is_empty() {
        return Err(ProtoError::MissingField("id"));
    }

    Ok(ids
        .into_iter()
        .map(|server_id| StatusUpdate {
            server_id,
            chat_id: chat_id.clone(),
            status,
        })
        .collect())
}

pub fn parse_connection_status(data: &Value) -> Result<GatewayConnectionStatus, ProtoError> {
    if let Value::String(state) = data {
        return Ok(GatewayConnectionStatus::from(state.as_str()));
    }
    if let Some(state) = str_at(data, &["state", "status", "connection", "instance.status"]) {
        return Ok(GatewayConnectionStatus::from(state.as_str()));
    }
    match bool_at(data, &["connected", "status.connected"]) {
        Some(true) => Ok(GatewayConnectionStatus::Open),
        Some(false) => Ok(GatewayConnectionStatus::Closed),
        None => Err(ProtoError::MissingField("state")),
    }
}

pub fn parse_presence(data: &Value) -> Result<PresenceUpdate, ProtoError> {
    Ok(PresenceUpdate {
        chat_id: str_at(data, &["chatid", "chatId", "id", "jid", "Chat"])
            .ok_or(ProtoError::MissingField("chatid"))?,
        presence: str_at(data, &["presence", "state", "lastKnownPresence", "State"])
            .unwrap_or_else(|| "unavailable".to_string()),
    })
}

pub fn parse_chat(data: &Value) -> Result<ChatSummary, ProtoError> {
    let id = str_at(
        data,
        &["id", "wa_chatid", "chatid", "chatId", "jid", "remoteJid"],
    )
    .ok_or(ProtoError::MissingField("id"))?;

    Ok(ChatSummary {
        id,
        name: str_at(
            data,
            &["name", "wa_name", "wa_contactName", "displayName", "subject", "pushName"],
        ),
        image_url: str_at(data, &["image", "imgUrl", "profilePicUrl", "imagePreview"]),
        last_message_preview: str_at(
            data,
            &[
                "lastMessagePreview",
                "lastMessage",
                "lastMessage.text",
                "lastMessage.content",
                "wa_lastMessageTextVote",
            ],
        ),
        last_message_timestamp: timestamp_at(
            data,
            &[
                "lastMessageTimestamp",
                "wa_lastMsgTimestamp",
                "conversationTimestamp",
                "lastMessage.messageTimestamp",
            ],
        ),
        unread_count: u32_at(data, &["unreadCount", "wa_unreadCount", "unread"]),
    })
}

fn list_at<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Vec<Value>> {
    value
        .as_array()
        .or_else(|| paths.iter().find_map(|path| lookup(value, path)?.as_array()))
}

/// Parses a bulk chat snapshot. Entries without an id are skipped.
pub fn parse_chat_list(value: &Value) -> Result<Vec<ChatSummary>, ProtoError> {
    let items = list_at(value, &["chats", "data"])
        .ok_or_else(|| ProtoError::UnexpectedShape("no chat list in response".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| match parse_chat(item) {
            Ok(chat) => Some(chat),
            Err(e) => {
                debug!("Skipping chat entry: {e}");
                None
            }
        })
        .collect())
}

/// Parses a history page for `chat_id`.
pub fn parse_message_list(
    value: &Value,
    chat_id: &str,
) -> Result<Vec<IncomingMessage>, ProtoError> {
    let items = list_at(value, &["messages", "messages.records", "data"])
        .ok_or_else(|| ProtoError::UnexpectedShape("no message list in response".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| match parse_message(item, Some(chat_id)) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Skipping history entry: {e}");
                None
            }
        })
        .collect())
}

/// Parses a `/message/send*` response: `{key:{id}, messageTimestamp, status?}`.
pub fn parse_send_response(value: &Value) -> Result<SentReceipt, ProtoError> {
    let server_id = str_at(value, &["key.id", "id", "messageid", "messageId"])
        .ok_or(ProtoError::MissingField("key.id"))?;
    let status = match str_at(value, &["status"]).and_then(|s| MessageStatus::from_wire(&s)) {
        Some(MessageStatus::Failed) => {
            return Err(ProtoError::Rejected(format!("message {server_id} failed")));
        }
        // The gateway accepted the message, so it is at least sent.
        Some(status) => status.merge(MessageStatus::Sent),
        None => MessageStatus::Sent,
    };
    Ok(SentReceipt {
        server_id,
        timestamp: timestamp_at(value, &["messageTimestamp", "timestamp"]),
        status,
    })
}

pub fn parse_profile(value: &Value) -> ProfileInfo {
    ProfileInfo {
        name: str_at(value, &["name", "wa_name", "pushName", "verifiedName"]),
        image_url: str_at(value, &["imgUrl", "image", "profilePicUrl", "url"]),
    }
}

/// Reads the instance status response. `true` when the gateway reports the
/// WhatsApp session as connected.
pub fn parse_instance_connected(value: &Value) -> Result<bool, ProtoError> {
    if let Some(connected) = bool_at(value, &["connected", "status.connected", "instance.connected"])
    {
        return Ok(connected);
    }
    let state = str_at(
        value,
        &["state", "status", "instance.state", "instance.status", "status.state"],
    )
    .ok_or_else(|| ProtoError::UnexpectedShape("no connection state in status response".into()))?;
    Ok(GatewayConnectionStatus::from(state.as_str()) == GatewayConnectionStatus::Open)
}

/// Endpoint path and JSON body for sending `content` to `chat_id`.
pub fn send_request(
    chat_id: &str,
    content: &MessageContent,
) -> Result<(&'static str, Value), ProtoError> {
    let request = match content {
        MessageContent::Text { body } => ("/message/sendText", json!({ "chatId": chat_id, "text": body })),
        MessageContent::Image { url, caption } | MessageContent::Video { url, caption } => {
            let url = url.as_deref().ok_or(ProtoError::MissingField("mediaUrl"))?;
            let mut body = json!({
                "chatId": chat_id,
                "mediaType": content.kind().wire_name(),
                "mediaUrl": url,
            });
            if let Some(caption) = caption {
                body["caption"] = json!(caption);
            }
            ("/message/sendMedia", body)
        }
        MessageContent::Audio { url, voice_note } => {
            let url = url.as_deref().ok_or(ProtoError::MissingField("mediaUrl"))?;
            (
                "/message/sendMedia",
                json!({
                    "chatId": chat_id,
                    "mediaType": if *voice_note { "ptt" } else { "audio" },
                    "mediaUrl": url,
                }),
            )
        }
        MessageContent::Document {
            url,
            file_name,
            caption,
        } => {
            let url = url.as_deref().ok_or(ProtoError::MissingField("mediaUrl"))?;
            let mut body = json!({
                "chatId": chat_id,
                "mediaType": "document",
                "mediaUrl": url,
            });
            if let Some(file_name) = file_name {
                body["fileName"] = json!(file_name);
            }
            if let Some(caption) = caption {
                body["caption"] = json!(caption);
            }
            ("/message/sendMedia", body)
        }
        MessageContent::Sticker { url } => {
            let url = url.as_deref().ok_or(ProtoError::MissingField("mediaUrl"))?;
            (
                "/message/sendMedia",
                json!({ "chatId": chat_id, "mediaType": "sticker", "mediaUrl": url }),
            )
        }
        MessageContent::Location {
            latitude,
            longitude,
            name,
        } => {
            let mut body = json!({
                "chatId": chat_id,
                "latitude": latitude,
                "longitude": longitude,
            });
            if let Some(name) = name {
                body["name"] = json!(name);
            }
            ("/message/sendLocation", body)
        }
        MessageContent::Contact {
            display_name,
            vcard,
        } => (
            "/message/sendContact",
            json!({ "chatId": chat_id, "fullName": display_name, "vcard": vcard }),
        ),
        MessageContent::Empty => return Err(ProtoError::Unsendable(MediaKind::None)),
    };
    Ok(request)
}
