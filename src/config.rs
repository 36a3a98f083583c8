use std::time::Duration;
use whatsapp_console_core::backoff::ReconnectPolicy;
use whatsapp_console_core::store::DEFAULT_PENDING_CAPACITY;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
/// Silence after which the event stream is considered dead.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Gateway base URL, without a trailing slash.
    pub base_url: String,
    /// Upper bound on a single send call before the message is marked failed.
    pub send_timeout: Duration,
    /// Capacity of the channel between the stream reader and the dispatcher.
    pub event_channel_capacity: usize,
    pub reconnect: ReconnectPolicy,
    /// Reconnects when the stream delivers nothing, keepalives included,
    /// for this long. `None` waits forever.
    pub stream_idle_timeout: Option<Duration>,
    /// When set, re-fetches a chat's history this long after each send.
    pub post_send_resync: Option<Duration>,
    pub history_page_size: u32,
    pub pending_status_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            reconnect: ReconnectPolicy::default(),
            stream_idle_timeout: Some(DEFAULT_STREAM_IDLE_TIMEOUT),
            post_send_resync: None,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            pending_status_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }
}

/// Credentials of one gateway instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceCredentials {
    pub instance_id: String,
    pub token: String,
}

impl InstanceCredentials {
    pub fn new(instance_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            token: token.into(),
        }
    }
}
