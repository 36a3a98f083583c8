use crate::jid;
use serde::Serialize;

/// Progress of a profile lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchState {
    Absent,
    Pending,
    Resolved,
    Failed,
}

/// Profile fields returned by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileInfo {
    pub name: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileEntry {
    /// Normalized contact number, or full group id.
    pub key: String,
    pub display_name: String,
    pub image_url: Option<String>,
    pub fetch_state: FetchState,
}

impl ProfileEntry {
    pub fn resolved(key: impl Into<String>, info: ProfileInfo) -> Self {
        let key = key.into();
        let display_name = info
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| jid::placeholder_name(&key));
        Self {
            key,
            display_name,
            image_url: info.image_url.filter(|url| !url.is_empty()),
            fetch_state: FetchState::Resolved,
        }
    }

    /// Soft-failure entry carrying a name derived from the number.
    pub fn placeholder(key: impl Into<String>, fetch_state: FetchState) -> Self {
        let key = key.into();
        Self {
            display_name: jid::placeholder_name(&key),
            key,
            image_url: None,
            fetch_state,
        }
    }
}
