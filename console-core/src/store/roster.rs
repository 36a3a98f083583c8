use crate::jid;
use crate::types::{Chat, ChatSummary};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The sidebar chat list, keyed by chat id.
///
/// Bulk snapshots and stream nudges are both merged by id; nothing ever
/// replaces the roster wholesale.
#[derive(Debug, Default)]
pub struct ChatRoster {
    chats: HashMap<String, Chat>,
    active: Option<String>,
}

/// Roster order: newest activity first, chats without activity last, then by id.
pub fn roster_order(a: &Chat, b: &Chat) -> Ordering {
    match (a.last_message_timestamp, b.last_message_timestamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

impl ChatRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a full chat snapshot. Returns the ids of chats that changed.
    pub fn merge_snapshot(&mut self, summaries: Vec<ChatSummary>) -> Vec<String> {
        summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id.clone();
                self.merge_summary(summary).then_some(id)
            })
            .collect()
    }

    /// Merges one chat's gateway-reported fields.
    ///
    /// Name and avatar are taken whenever present. Preview, timestamp and
    /// unread count are taken only if the summary is strictly newer than what
    /// the roster holds; otherwise the unread count can only go up. Counts
    /// older than the last explicit mark-read are ignored.
    pub fn merge_summary(&mut self, summary: ChatSummary) -> bool {
        let is_active = self.is_active(&summary.id);
        let chat = self
            .chats
            .entry(summary.id.clone())
            .or_insert_with(|| Chat::new(summary.id.clone()));
        let before = chat.clone();

        if let Some(name) = summary.name {
            chat.display_name = Some(name);
        }
        if let Some(url) = summary.image_url {
            chat.profile_image_url = Some(url);
        }

        let newer = match (summary.last_message_timestamp, chat.last_message_timestamp) {
            (Some(incoming), Some(current)) => incoming > current,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let already_read = match (summary.last_message_timestamp, chat.last_read_at) {
            (Some(incoming), Some(read_at)) => incoming <= read_at,
            (None, Some(_)) => true,
            (_, None) => false,
        };

        if newer {
            if summary.last_message_preview.is_some() {
                chat.last_message_preview = summary.last_message_preview;
            }
            chat.last_message_timestamp = summary.last_message_timestamp;
            if let Some(unread) = summary.unread_count
                && !already_read
            {
                chat.unread_count = unread;
            }
        } else {
            if chat.last_message_preview.is_none() {
                chat.last_message_preview = summary.last_message_preview;
            }
            if let Some(unread) = summary.unread_count
                && !already_read
            {
                chat.unread_count = chat.unread_count.max(unread);
            }
        }
        if is_active {
            chat.unread_count = 0;
        }

        *chat != before
    }

    /// Records a new message in a chat's summary. `unread_delta` is added to
    /// the unread count unless the chat is open.
    pub fn apply_increment(
        &mut self,
        chat_id: &str,
        preview: Option<String>,
        timestamp: DateTime<Utc>,
        unread_delta: u32,
    ) -> bool {
        let is_active = self.is_active(chat_id);
        let chat = self
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| Chat::new(chat_id));
        let before = chat.clone();

        if chat.last_message_timestamp.is_none_or(|current| timestamp >= current) {
            if preview.is_some() {
                chat.last_message_preview = preview;
            }
            chat.last_message_timestamp = Some(timestamp);
        }
        if !is_active {
            chat.unread_count = chat.unread_count.saturating_add(unread_delta);
        }

        *chat != before
    }

    /// Explicit user mark-read: resets unread to zero.
    pub fn mark_read(&mut self, chat_id: &str) -> bool {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            return false;
        };
        let before = chat.clone();
        let read_up_to = chat.last_message_timestamp.unwrap_or_else(Utc::now);
        chat.last_read_at = Some(chat.last_read_at.map_or(read_up_to, |t| t.max(read_up_to)));
        chat.unread_count = 0;
        *chat != before
    }

    /// Applies a resolved profile to every chat whose id normalizes to `key`.
    /// Returns the ids of chats that changed.
    pub fn apply_profile(
        &mut self,
        key: &str,
        display_name: &str,
        image_url: Option<&str>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for chat in self.chats.values_mut() {
            if jid::normalize_key(&chat.id) != key {
                continue;
            }
            let before = chat.clone();
            // Gateway-provided names win over profile lookups.
            if chat.display_name.is_none() {
                chat.display_name = Some(display_name.to_string());
            }
            if let Some(url) = image_url {
                chat.profile_image_url = Some(url.to_string());
            }
            if *chat != before {
                changed.push(chat.id.clone());
            }
        }
        changed
    }

    pub fn set_active(&mut self, chat_id: Option<&str>) {
        self.active = chat_id.map(str::to_string);
    }

    fn is_active(&self, chat_id: &str) -> bool {
        self.active.as_deref() == Some(chat_id)
    }

    pub fn get(&self, chat_id: &str) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    /// All chats in display order.
    pub fn ordered(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        chats.sort_by(roster_order);
        chats
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn clear(&mut self) {
        self.chats.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn summary(id: &str, secs: Option<i64>, unread: Option<u32>) -> ChatSummary {
        ChatSummary {
            id: id.to_string(),
            last_message_timestamp: secs.map(ts),
            unread_count: unread,
            last_message_preview: secs.map(|s| format!("preview {s}")),
            ..Default::default()
        }
    }

    fn ids(roster: &ChatRoster) -> Vec<String> {
        roster.ordered().into_iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_snapshot_does_not_reset_fresher_unread() {
        let mut roster = ChatRoster::new();
        roster.merge_snapshot(vec![summary("a@s.whatsapp.net", Some(100), Some(0))]);
        for secs in [110, 120, 130] {
            roster.apply_increment("a@s.whatsapp.net", Some("hi".into()), ts(secs), 1);
        }
        assert_eq!(roster.get("a@s.whatsapp.net").unwrap().unread_count, 3);

        // Snapshot requested before the increments arrived.
        roster.merge_snapshot(vec![summary("a@s.whatsapp.net", Some(100), Some(0))]);
        let chat = roster.get("a@s.whatsapp.net").unwrap();
        assert_eq!(chat.unread_count, 3);
        assert_eq!(chat.last_message_timestamp, Some(ts(130)));
        assert_eq!(chat.last_message_preview.as_deref(), Some("hi"));
    }

    #[test]
    fn test_strictly_newer_snapshot_wins() {
        let mut roster = ChatRoster::new();
        roster.apply_increment("a@s.whatsapp.net", None, ts(100), 3);
        roster.merge_snapshot(vec![summary("a@s.whatsapp.net", Some(200), Some(1))]);

        let chat = roster.get("a@s.whatsapp.net").unwrap();
        assert_eq!(chat.unread_count, 1);
        assert_eq!(chat.last_message_preview.as_deref(), Some("preview 200"));
    }

    #[test]
    fn test_snapshot_keeps_chats_it_does_not_mention() {
        let mut roster = ChatRoster::new();
        roster.apply_increment("a@s.whatsapp.net", None, ts(1), 1);
        roster.merge_snapshot(vec![summary("b@s.whatsapp.net", Some(2), None)]);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_mark_read_resets_and_ignores_stale_counts() {
        let mut roster = ChatRoster::new();
        roster.apply_increment("a@s.whatsapp.net", None, ts(100), 4);
        assert!(roster.mark_read("a@s.whatsapp.net"));
        assert_eq!(roster.get("a@s.whatsapp.net").unwrap().unread_count, 0);

        roster.merge_snapshot(vec![summary("a@s.whatsapp.net", Some(100), Some(4))]);
        assert_eq!(roster.get("a@s.whatsapp.net").unwrap().unread_count, 0);

        roster.merge_snapshot(vec![summary("a@s.whatsapp.net", Some(150), Some(1))]);
        assert_eq!(roster.get("a@s.whatsapp.net").unwrap().unread_count, 1);

        assert!(!roster.mark_read("unknown@s.whatsapp.net"));
    }

    #[test]
    fn test_active_chat_does_not_accumulate_unread() {
        let mut roster = ChatRoster::new();
        roster.set_active(Some("a@s.whatsapp.net"));
        roster.apply_increment("a@s.whatsapp.net", None, ts(1), 1);
        roster.merge_summary(summary("a@s.whatsapp.net", Some(2), Some(5)));
        assert_eq!(roster.get("a@s.whatsapp.net").unwrap().unread_count, 0);
    }

    #[test]
    fn test_ordering_is_newest_first_with_id_tiebreak() {
        let mut roster = ChatRoster::new();
        roster.merge_snapshot(vec![
            summary("c@s.whatsapp.net", Some(10), None),
            summary("b@s.whatsapp.net", Some(20), None),
            summary("a@s.whatsapp.net", Some(20), None),
            summary("z@g.us", None, None),
        ]);
        assert_eq!(
            ids(&roster),
            vec!["a@s.whatsapp.net", "b@s.whatsapp.net", "c@s.whatsapp.net", "z@g.us"]
        );
        assert!(roster.get("z@g.us").unwrap().is_group);
    }

    #[test]
    fn test_older_increment_does_not_replace_preview() {
        let mut roster = ChatRoster::new();
        roster.apply_increment("a@s.whatsapp.net", Some("new".into()), ts(200), 0);
        roster.apply_increment("a@s.whatsapp.net", Some("old".into()), ts(100), 1);

        let chat = roster.get("a@s.whatsapp.net").unwrap();
        assert_eq!(chat.last_message_preview.as_deref(), Some("new"));
        assert_eq!(chat.unread_count, 1);
    }

    #[test]
    fn test_profile_fills_missing_names_only() {
        let mut roster = ChatRoster::new();
        roster.apply_increment("5511999999999@s.whatsapp.net", None, ts(1), 0);
        roster.merge_summary(ChatSummary {
            id: "5511888888888@s.whatsapp.net".into(),
            name: Some("Bruno".into()),
            ..Default::default()
        });

        let changed = roster.apply_profile("5511999999999", "Ana", Some("https://img/ana"));
        assert_eq!(changed, vec!["5511999999999@s.whatsapp.net".to_string()]);
        assert_eq!(
            roster.get("5511999999999@s.whatsapp.net").unwrap().title(),
            "Ana"
        );

        roster.apply_profile("5511888888888", "Other", None);
        assert_eq!(
            roster.get("5511888888888@s.whatsapp.net").unwrap().title(),
            "Bruno"
        );
    }
}
