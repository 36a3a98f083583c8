use crate::profile_cache::{ProfileCache, ProfileFetcher};
use crate::types::events::{Event, EventBus};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use whatsapp_console_core::store::{ChatRoster, MessageStore};
use whatsapp_console_core::types::{FetchState, ProfileEntry};

/// Stores shared by the console facade, the dispatcher and send tasks.
///
/// The store mutexes are only held for synchronous merges, never across an
/// await.
pub(crate) struct ConsoleState {
    pub messages: Mutex<MessageStore>,
    pub roster: Mutex<ChatRoster>,
    pub profiles: ProfileCache,
    pub events: EventBus,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("mutex should not be poisoned")
}

impl ConsoleState {
    pub fn new(pending_status_capacity: usize, events: EventBus) -> Self {
        Self {
            messages: Mutex::new(MessageStore::with_pending_capacity(pending_status_capacity)),
            roster: Mutex::new(ChatRoster::new()),
            profiles: ProfileCache::new(),
            events,
        }
    }

    /// Resolves a profile and pushes a fresh result into the roster.
    pub async fn resolve_profile(
        &self,
        fetcher: &Arc<dyn ProfileFetcher>,
        id: &str,
    ) -> ProfileEntry {
        let was_resolved = self.profiles.state(id) == FetchState::Resolved;
        let entry = self.profiles.resolve(fetcher, id).await;
        if entry.fetch_state == FetchState::Resolved && !was_resolved {
            let changed = lock(&self.roster).apply_profile(
                &entry.key,
                &entry.display_name,
                entry.image_url.as_deref(),
            );
            self.events.dispatch(Event::ProfileResolved {
                key: entry.key.clone(),
            });
            if !changed.is_empty() {
                self.events.dispatch(Event::RosterChanged);
            }
        }
        entry
    }

    /// Starts a background lookup for `id` unless one already ran or is running.
    /// Failed lookups are not retried here.
    pub fn spawn_profile_lookup(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        fetcher: &Arc<dyn ProfileFetcher>,
        id: &str,
    ) {
        if self.profiles.state(id) != FetchState::Absent {
            return;
        }
        let state = self.clone();
        let fetcher = fetcher.clone();
        let id = id.to_string();
        tasks.spawn(async move {
            state.resolve_profile(&fetcher, &id).await;
        });
    }

    pub fn clear(&self) {
        lock(&self.messages).clear();
        lock(&self.roster).clear();
        self.profiles.reset();
    }
}
