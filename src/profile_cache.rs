//! Contact and group display info, fetched lazily and shared across chats.

use crate::error::GatewayError;
use crate::gateway::GatewayClient;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use whatsapp_console_core::jid;
use whatsapp_console_core::types::{FetchState, ProfileEntry, ProfileInfo};

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(&self, key: &str) -> Result<ProfileInfo, GatewayError>;
}

#[async_trait]
impl ProfileFetcher for GatewayClient {
    async fn fetch_profile(&self, key: &str) -> Result<ProfileInfo, GatewayError> {
        GatewayClient::fetch_profile(self, key).await
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<ProfileInfo, Arc<GatewayError>>>>;

enum Slot {
    Pending { fetch: SharedFetch, generation: u64 },
    Resolved(ProfileEntry),
    Failed(ProfileEntry),
}

/// Per-key profile cache with request coalescing.
///
/// Keys are normalized with [`jid::normalize_key`], so every spelling of a
/// contact id shares one entry. While a fetch for a key is in flight, every
/// `resolve` for that key awaits the same shared future.
#[derive(Default)]
pub struct ProfileCache {
    slots: DashMap<String, Slot>,
    generation: AtomicU64,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `id` to a profile entry. Never fails: a failed fetch yields
    /// a placeholder named after the number, and the next call retries.
    pub async fn resolve(&self, fetcher: &Arc<dyn ProfileFetcher>, id: &str) -> ProfileEntry {
        let key = jid::normalize_key(id);
        let (fetch, generation) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Resolved(entry) => return entry.clone(),
                Slot::Pending { fetch, generation } => {
                    debug!(target: "Console/Profile", "Joining in-flight fetch for {key}");
                    (fetch.clone(), *generation)
                }
                Slot::Failed(_) => {
                    let (fetch, generation) = self.start_fetch(fetcher, &key);
                    occupied.insert(Slot::Pending {
                        fetch: fetch.clone(),
                        generation,
                    });
                    (fetch, generation)
                }
            },
            Entry::Vacant(vacant) => {
                let (fetch, generation) = self.start_fetch(fetcher, &key);
                vacant.insert(Slot::Pending {
                    fetch: fetch.clone(),
                    generation,
                });
                (fetch, generation)
            }
        };

        let result = fetch.clone().await;
        let resolved = result.is_ok();
        let entry = match result {
            Ok(info) => ProfileEntry::resolved(key.clone(), info),
            Err(e) => {
                warn!(target: "Console/Profile", "Profile fetch for {key} failed: {e}");
                ProfileEntry::placeholder(key.clone(), FetchState::Failed)
            }
        };

        // Only the fetch that owns the slot may settle it; a reset in between
        // abandons the result.
        if let Some(mut slot) = self.slots.get_mut(&key)
            && let Slot::Pending {
                fetch: current,
                generation: slot_generation,
            } = &*slot
            && *slot_generation == generation
            && current.ptr_eq(&fetch)
        {
            *slot = if resolved {
                Slot::Resolved(entry.clone())
            } else {
                Slot::Failed(entry.clone())
            };
        }
        entry
    }

    fn start_fetch(&self, fetcher: &Arc<dyn ProfileFetcher>, key: &str) -> (SharedFetch, u64) {
        debug!(target: "Console/Profile", "Fetching profile for {key}");
        let fetcher = fetcher.clone();
        let owned_key = key.to_string();
        let fetch = async move { fetcher.fetch_profile(&owned_key).await.map_err(Arc::new) }
            .boxed()
            .shared();
        (fetch, self.generation.load(Ordering::Acquire))
    }

    /// Current entry for `id`, without fetching.
    pub fn lookup(&self, id: &str) -> ProfileEntry {
        let key = jid::normalize_key(id);
        match self.slots.get(&key).as_deref() {
            Some(Slot::Resolved(entry)) | Some(Slot::Failed(entry)) => entry.clone(),
            Some(Slot::Pending { .. }) => ProfileEntry::placeholder(key, FetchState::Pending),
            None => ProfileEntry::placeholder(key, FetchState::Absent),
        }
    }

    pub fn state(&self, id: &str) -> FetchState {
        self.lookup(id).fetch_state
    }

    /// Drops every entry and abandons in-flight fetches.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
