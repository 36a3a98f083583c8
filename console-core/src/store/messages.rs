use crate::types::{
    Direction, IncomingMessage, LocalId, Message, MessageContent, MessageStatus,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use thiserror::Error;

/// Default bound on status updates buffered for unknown server ids.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no message with local id {0}")]
    UnknownLocalId(LocalId),
    #[error("message {0} is not awaiting a send result")]
    NotPending(LocalId),
    #[error("message {local_id} is already bound to server id {existing}")]
    ServerIdConflict { local_id: LocalId, existing: String },
    #[error("message {local_id} cannot be retried while {status}")]
    NotRetryable {
        local_id: LocalId,
        status: MessageStatus,
    },
}

/// Result of [`MessageStore::apply_status_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied {
        local_id: LocalId,
        chat_id: String,
        status: MessageStatus,
    },
    /// The message already had this status.
    Unchanged(LocalId),
    /// The update would move the status backwards and was dropped.
    Regressed {
        local_id: LocalId,
        current: MessageStatus,
    },
    /// No message carries this server id yet; the update is held for replay.
    Buffered,
    /// Inbound messages never change status.
    IgnoredInbound(LocalId),
}

/// Result of [`MessageStore::append_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(LocalId),
    /// Same server id seen before; nothing changed.
    Duplicate(LocalId),
    /// Redelivery of one of our own messages that carried a newer status.
    StatusMerged {
        local_id: LocalId,
        status: MessageStatus,
    },
}

/// Result of a successful [`MessageStore::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub chat_id: String,
    pub status: MessageStatus,
    /// Local id of a stream echo of this message that was folded into it.
    pub absorbed: Option<LocalId>,
}

/// The chat-scoped ordered message log.
///
/// Entries in a chat are ordered by `(ordered_at, local_id)`. `ordered_at` is
/// fixed on insertion, so reconciling a provisional timestamp never moves an
/// entry. Server ids form a single key space shared by reconciled sends and
/// inbound appends, so a stream echo and the REST response of the same send
/// collapse into one entry whichever lands first.
#[derive(Debug)]
pub struct MessageStore {
    chats: HashMap<String, Vec<Message>>,
    locations: HashMap<LocalId, String>,
    by_server_id: HashMap<String, LocalId>,
    pending_status: IndexMap<String, MessageStatus>,
    pending_capacity: usize,
    next_local: u64,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_pending_capacity(DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_pending_capacity(pending_capacity: usize) -> Self {
        Self {
            chats: HashMap::new(),
            locations: HashMap::new(),
            by_server_id: HashMap::new(),
            pending_status: IndexMap::new(),
            pending_capacity: pending_capacity.max(1),
            next_local: 1,
        }
    }

    fn allocate_local_id(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        id
    }

    fn insert_sorted(&mut self, message: Message) -> LocalId {
        let local_id = message.local_id;
        let key = message.sort_key();
        self.locations.insert(local_id, message.chat_id.clone());
        let list = self.chats.entry(message.chat_id.clone()).or_default();
        let pos = list
            .binary_search_by(|m| m.sort_key().cmp(&key))
            .unwrap_or_else(|pos| pos);
        list.insert(pos, message);
        local_id
    }

    fn entry_mut(&mut self, local_id: LocalId) -> Option<&mut Message> {
        let chat_id = self.locations.get(&local_id)?;
        self.chats
            .get_mut(chat_id)?
            .iter_mut()
            .find(|m| m.local_id == local_id)
    }

    fn remove_entry(&mut self, local_id: LocalId) -> Option<Message> {
        let chat_id = self.locations.remove(&local_id)?;
        let list = self.chats.get_mut(&chat_id)?;
        let pos = list.iter().position(|m| m.local_id == local_id)?;
        Some(list.remove(pos))
    }

    /// Adds an outbound message in `sending` state, timestamped now.
    pub fn append_optimistic(&mut self, chat_id: &str, content: MessageContent) -> LocalId {
        self.append_optimistic_at(chat_id, content, Utc::now())
    }

    pub fn append_optimistic_at(
        &mut self,
        chat_id: &str,
        content: MessageContent,
        at: DateTime<Utc>,
    ) -> LocalId {
        let local_id = self.allocate_local_id();
        debug!("Optimistic append {local_id} to {chat_id}");
        self.insert_sorted(Message {
            local_id,
            server_id: None,
            chat_id: chat_id.to_string(),
            direction: Direction::Outbound,
            sender: None,
            sender_name: None,
            content,
            status: MessageStatus::Sending,
            timestamp: at,
            ordered_at: at,
        })
    }

    /// Binds a sent message to its server id once the send call returns.
    ///
    /// The entry keeps its local id and list position. If the stream already
    /// delivered the echo of this message, the echo is folded in and removed.
    /// Status updates buffered for `server_id` are replayed.
    pub fn reconcile(
        &mut self,
        local_id: LocalId,
        server_id: &str,
        server_timestamp: Option<DateTime<Utc>>,
        initial_status: MessageStatus,
    ) -> Result<Reconciled, StoreError> {
        let entry = self
            .entry_mut(local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        match entry.server_id.as_deref() {
            Some(existing) if existing == server_id => {
                return Ok(Reconciled {
                    chat_id: entry.chat_id.clone(),
                    status: entry.status,
                    absorbed: None,
                });
            }
            Some(existing) => {
                return Err(StoreError::ServerIdConflict {
                    local_id,
                    existing: existing.to_string(),
                });
            }
            None if entry.status != MessageStatus::Sending => {
                return Err(StoreError::NotPending(local_id));
            }
            None => {}
        }

        let mut status = MessageStatus::Sending.merge(initial_status);
        let mut absorbed = None;
        if let Some(&echo_id) = self.by_server_id.get(server_id)
            && echo_id != local_id
            && let Some(echo) = self.remove_entry(echo_id)
        {
            debug!("Folding stream echo {echo_id} into {local_id} ({server_id})");
            status = status.merge(echo.status);
            absorbed = Some(echo_id);
        }
        if let Some(buffered) = self.pending_status.shift_remove(server_id) {
            debug!("Replaying buffered status {buffered} for {server_id}");
            status = status.merge(buffered);
        }

        self.by_server_id.insert(server_id.to_string(), local_id);
        let entry = self
            .entry_mut(local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        entry.server_id = Some(server_id.to_string());
        if let Some(ts) = server_timestamp {
            entry.timestamp = ts;
        }
        entry.status = status;
        Ok(Reconciled {
            chat_id: entry.chat_id.clone(),
            status,
            absorbed,
        })
    }

    /// Marks a message whose send call failed. Returns `false` when the entry
    /// was no longer waiting on a send result.
    pub fn fail(&mut self, local_id: LocalId) -> Result<bool, StoreError> {
        let entry = self
            .entry_mut(local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        if entry.status != MessageStatus::Sending || entry.server_id.is_some() {
            return Ok(false);
        }
        entry.status = MessageStatus::Failed;
        Ok(true)
    }

    /// Moves a failed message back to `sending` for another attempt, keeping
    /// its local id and position. Returns the chat id and content to resend.
    pub fn begin_retry(
        &mut self,
        local_id: LocalId,
    ) -> Result<(String, MessageContent), StoreError> {
        let entry = self
            .entry_mut(local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        if entry.status != MessageStatus::Failed || entry.server_id.is_some() {
            return Err(StoreError::NotRetryable {
                local_id,
                status: entry.status,
            });
        }
        entry.status = MessageStatus::Sending;
        Ok((entry.chat_id.clone(), entry.content.clone()))
    }

    /// Applies a delivery status reported for `server_id`.
    pub fn apply_status_update(&mut self, server_id: &str, status: MessageStatus) -> StatusOutcome {
        let Some(&local_id) = self.by_server_id.get(server_id) else {
            self.buffer_status(server_id, status);
            return StatusOutcome::Buffered;
        };
        let Some(entry) = self.entry_mut(local_id) else {
            warn!("Server id {server_id} points at missing entry {local_id}");
            return StatusOutcome::Buffered;
        };
        if entry.direction == Direction::Inbound {
            return StatusOutcome::IgnoredInbound(local_id);
        }
        if entry.status == status {
            return StatusOutcome::Unchanged(local_id);
        }
        if !entry.status.can_advance_to(status) {
            debug!(
                "Dropping status regression for {server_id}: {} -> {status}",
                entry.status
            );
            return StatusOutcome::Regressed {
                local_id,
                current: entry.status,
            };
        }
        entry.status = status;
        StatusOutcome::Applied {
            local_id,
            chat_id: entry.chat_id.clone(),
            status,
        }
    }

    fn buffer_status(&mut self, server_id: &str, status: MessageStatus) {
        let merged = self
            .pending_status
            .get(server_id)
            .map_or(status, |current| current.merge(status));
        self.pending_status.insert(server_id.to_string(), merged);
        while self.pending_status.len() > self.pending_capacity {
            if let Some((evicted, _)) = self.pending_status.shift_remove_index(0) {
                debug!("Pending status buffer full, evicting {evicted}");
            }
        }
    }

    /// Appends a message delivered by the gateway. A server id that is
    /// already known is a no-op, except that a newer status on one of our
    /// own messages is merged in.
    pub fn append_inbound(&mut self, message: IncomingMessage) -> AppendOutcome {
        if let Some(&local_id) = self.by_server_id.get(&message.server_id) {
            let Some(entry) = self.entry_mut(local_id) else {
                return AppendOutcome::Duplicate(local_id);
            };
            if let (Direction::Outbound, Some(reported)) = (entry.direction, message.status) {
                let merged = entry.status.merge(reported);
                if merged != entry.status {
                    entry.status = merged;
                    return AppendOutcome::StatusMerged {
                        local_id,
                        status: merged,
                    };
                }
            }
            return AppendOutcome::Duplicate(local_id);
        }

        let (direction, status) = if message.from_me {
            let status = message
                .status
                .unwrap_or(MessageStatus::Sent)
                .merge(MessageStatus::Sent);
            let status = match self.pending_status.shift_remove(&message.server_id) {
                Some(buffered) => status.merge(buffered),
                None => status,
            };
            (Direction::Outbound, status)
        } else {
            self.pending_status.shift_remove(&message.server_id);
            (Direction::Inbound, MessageStatus::Delivered)
        };

        let local_id = self.allocate_local_id();
        self.by_server_id.insert(message.server_id.clone(), local_id);
        self.insert_sorted(Message {
            local_id,
            server_id: Some(message.server_id),
            chat_id: message.chat_id,
            direction,
            sender: message.sender,
            sender_name: message.sender_name,
            content: message.content,
            status,
            timestamp: message.timestamp,
            ordered_at: message.timestamp,
        });
        AppendOutcome::Inserted(local_id)
    }

    /// Merges a fetched history page. Returns how many entries changed.
    pub fn merge_history(&mut self, messages: Vec<IncomingMessage>) -> usize {
        messages
            .into_iter()
            .map(|m| self.append_inbound(m))
            .filter(|outcome| !matches!(outcome, AppendOutcome::Duplicate(_)))
            .count()
    }

    /// Ordered messages of a chat. Unknown chats are empty.
    pub fn messages(&self, chat_id: &str) -> &[Message] {
        self.chats.get(chat_id).map_or(&[], Vec::as_slice)
    }

    pub fn get(&self, local_id: LocalId) -> Option<&Message> {
        let chat_id = self.locations.get(&local_id)?;
        self.chats
            .get(chat_id)?
            .iter()
            .find(|m| m.local_id == local_id)
    }

    pub fn position(&self, local_id: LocalId) -> Option<usize> {
        let chat_id = self.locations.get(&local_id)?;
        self.chats
            .get(chat_id)?
            .iter()
            .position(|m| m.local_id == local_id)
    }

    pub fn find_by_server_id(&self, server_id: &str) -> Option<&Message> {
        self.get(*self.by_server_id.get(server_id)?)
    }

    pub fn last_message(&self, chat_id: &str) -> Option<&Message> {
        self.messages(chat_id).last()
    }

    /// Number of status updates waiting for their message to appear.
    pub fn pending_status_len(&self) -> usize {
        self.pending_status.len()
    }

    pub fn clear(&mut self) {
        self.chats.clear();
        self.locations.clear();
        self.by_server_id.clear();
        self.pending_status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn inbound(chat: &str, server_id: &str, secs: i64) -> IncomingMessage {
        IncomingMessage {
            chat_id: chat.to_string(),
            server_id: server_id.to_string(),
            from_me: false,
            sender: None,
            sender_name: None,
            content: MessageContent::text(format!("msg {server_id}")),
            timestamp: ts(secs),
            status: None,
        }
    }

    fn echo(chat: &str, server_id: &str, secs: i64, status: Option<MessageStatus>) -> IncomingMessage {
        IncomingMessage {
            from_me: true,
            status,
            ..inbound(chat, server_id, secs)
        }
    }

    fn server_ids(store: &MessageStore, chat: &str) -> Vec<Option<String>> {
        store.messages(chat).iter().map(|m| m.server_id.clone()).collect()
    }

    #[test]
    fn test_inbound_append_is_idempotent() {
        let mut store = MessageStore::new();
        let first = store.append_inbound(inbound("C1", "S1", 100));
        let second = store.append_inbound(inbound("C1", "S1", 100));

        let AppendOutcome::Inserted(local_id) = first else {
            panic!("first append should insert");
        };
        assert_eq!(second, AppendOutcome::Duplicate(local_id));
        assert_eq!(store.messages("C1").len(), 1);
    }

    #[test]
    fn test_messages_are_ordered_by_timestamp_then_local_id() {
        let mut store = MessageStore::new();
        store.append_inbound(inbound("C1", "late", 300));
        store.append_inbound(inbound("C1", "early", 100));
        store.append_inbound(inbound("C1", "tie-a", 200));
        store.append_inbound(inbound("C1", "tie-b", 200));

        assert_eq!(
            server_ids(&store, "C1"),
            vec![
                Some("early".to_string()),
                Some("tie-a".to_string()),
                Some("tie-b".to_string()),
                Some("late".to_string()),
            ]
        );
    }

    #[test]
    fn test_example_scenario_send_then_receipts() {
        let mut store = MessageStore::new();
        let l1 = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(990));
        assert_eq!(store.get(l1).unwrap().status, MessageStatus::Sending);

        let reconciled = store
            .reconcile(l1, "S9", Some(ts(1000)), MessageStatus::Sent)
            .unwrap();
        assert_eq!(reconciled.status, MessageStatus::Sent);

        assert!(matches!(
            store.apply_status_update("S9", MessageStatus::Delivered),
            StatusOutcome::Applied { status: MessageStatus::Delivered, .. }
        ));
        assert_eq!(
            store.apply_status_update("S9", MessageStatus::Sent),
            StatusOutcome::Regressed {
                local_id: l1,
                current: MessageStatus::Delivered
            }
        );

        let message = store.get(l1).unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.server_id.as_deref(), Some("S9"));
        assert_eq!(message.timestamp, ts(1000));
    }

    #[test]
    fn test_reconcile_preserves_position_and_identity() {
        let mut store = MessageStore::new();
        store.append_inbound(inbound("C1", "A", 100));
        let local = store.append_optimistic_at("C1", MessageContent::text("mine"), ts(200));
        store.append_inbound(inbound("C1", "B", 300));
        let before = store.position(local);

        // Server time lands after B, but the entry must not move.
        store
            .reconcile(local, "S1", Some(ts(400)), MessageStatus::Sent)
            .unwrap();

        assert_eq!(store.position(local), before);
        assert_eq!(store.get(local).unwrap().server_id.as_deref(), Some("S1"));
        assert_eq!(store.find_by_server_id("S1").unwrap().local_id, local);
    }

    #[test]
    fn test_race_reconcile_first_then_echo() {
        let mut store = MessageStore::new();
        let local = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(10));
        store.reconcile(local, "S1", Some(ts(11)), MessageStatus::Sent).unwrap();

        let outcome = store.append_inbound(echo("C1", "S1", 11, Some(MessageStatus::Sent)));
        assert_eq!(outcome, AppendOutcome::Duplicate(local));
        assert_eq!(store.messages("C1").len(), 1);
    }

    #[test]
    fn test_race_echo_first_then_reconcile() {
        let mut store = MessageStore::new();
        let local = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(10));
        let AppendOutcome::Inserted(echo_id) =
            store.append_inbound(echo("C1", "S1", 11, Some(MessageStatus::Delivered)))
        else {
            panic!("echo should insert before reconcile");
        };
        assert_eq!(store.messages("C1").len(), 2);

        let reconciled = store
            .reconcile(local, "S1", Some(ts(11)), MessageStatus::Sent)
            .unwrap();

        assert_eq!(reconciled.absorbed, Some(echo_id));
        assert_eq!(reconciled.status, MessageStatus::Delivered);
        let entries = store.messages("C1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_id, local);
        assert!(store.get(echo_id).is_none());
    }

    #[test]
    fn test_early_status_update_is_buffered_and_replayed() {
        let mut store = MessageStore::new();
        let local = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(10));

        assert_eq!(
            store.apply_status_update("S1", MessageStatus::Read),
            StatusOutcome::Buffered
        );
        assert_eq!(
            store.apply_status_update("S1", MessageStatus::Delivered),
            StatusOutcome::Buffered
        );
        assert_eq!(store.pending_status_len(), 1);

        let reconciled = store.reconcile(local, "S1", None, MessageStatus::Sent).unwrap();
        assert_eq!(reconciled.status, MessageStatus::Read);
        assert_eq!(store.pending_status_len(), 0);
    }

    #[test]
    fn test_monotonic_status_under_any_order() {
        use MessageStatus::*;
        let orders = [
            [Delivered, Read, Sent],
            [Read, Sent, Delivered],
            [Sent, Delivered, Read],
            [Read, Delivered, Sent],
        ];
        for order in orders {
            let mut store = MessageStore::new();
            let local = store.append_optimistic_at("C1", MessageContent::text("x"), ts(1));
            store.reconcile(local, "S1", None, Sent).unwrap();
            for status in order {
                store.apply_status_update("S1", status);
            }
            assert_eq!(store.get(local).unwrap().status, Read, "order {order:?}");
        }
    }

    #[test]
    fn test_failed_send_keeps_local_id_and_can_retry() {
        let mut store = MessageStore::new();
        let local = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(10));

        assert_eq!(store.fail(local), Ok(true));
        assert_eq!(store.get(local).unwrap().status, MessageStatus::Failed);
        assert!(matches!(
            store.reconcile(local, "S1", None, MessageStatus::Sent),
            Err(StoreError::NotPending(_))
        ));

        let (chat, content) = store.begin_retry(local).unwrap();
        assert_eq!(chat, "C1");
        assert_eq!(content, MessageContent::text("Hi"));
        assert_eq!(store.get(local).unwrap().status, MessageStatus::Sending);

        store.reconcile(local, "S1", None, MessageStatus::Sent).unwrap();
        assert!(matches!(
            store.begin_retry(local),
            Err(StoreError::NotRetryable { .. })
        ));
        assert_eq!(store.fail(local), Ok(false));
    }

    #[test]
    fn test_reconcile_rejects_conflicting_server_id() {
        let mut store = MessageStore::new();
        let local = store.append_optimistic_at("C1", MessageContent::text("Hi"), ts(10));
        store.reconcile(local, "S1", None, MessageStatus::Sent).unwrap();

        assert!(store.reconcile(local, "S1", None, MessageStatus::Sent).is_ok());
        assert_eq!(
            store.reconcile(local, "S2", None, MessageStatus::Sent),
            Err(StoreError::ServerIdConflict {
                local_id: local,
                existing: "S1".into()
            })
        );
        assert_eq!(
            store.reconcile(LocalId(999), "S3", None, MessageStatus::Sent),
            Err(StoreError::UnknownLocalId(LocalId(999)))
        );
    }

    #[test]
    fn test_inbound_messages_never_change_status() {
        let mut store = MessageStore::new();
        let AppendOutcome::Inserted(local) = store.append_inbound(inbound("C1", "S1", 1)) else {
            panic!("should insert");
        };
        assert_eq!(
            store.apply_status_update("S1", MessageStatus::Read),
            StatusOutcome::IgnoredInbound(local)
        );
        assert_eq!(store.get(local).unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn test_pending_buffer_evicts_oldest() {
        let mut store = MessageStore::with_pending_capacity(2);
        store.apply_status_update("A", MessageStatus::Read);
        store.apply_status_update("B", MessageStatus::Read);
        store.apply_status_update("C", MessageStatus::Read);
        assert_eq!(store.pending_status_len(), 2);

        let local = store.append_optimistic_at("C1", MessageContent::text("x"), ts(1));
        let reconciled = store.reconcile(local, "A", None, MessageStatus::Sent).unwrap();
        assert_eq!(reconciled.status, MessageStatus::Sent);
    }

    #[test]
    fn test_history_merge_counts_new_entries() {
        let mut store = MessageStore::new();
        store.append_inbound(inbound("C1", "S1", 1));
        let local = store.append_optimistic_at("C1", MessageContent::text("x"), ts(2));
        store.reconcile(local, "S2", None, MessageStatus::Sent).unwrap();

        let changed = store.merge_history(vec![
            inbound("C1", "S1", 1),
            echo("C1", "S2", 2, Some(MessageStatus::Read)),
            inbound("C1", "S3", 3),
        ]);
        assert_eq!(changed, 2);
        assert_eq!(store.messages("C1").len(), 3);
        assert_eq!(store.get(local).unwrap().status, MessageStatus::Read);
    }
}
