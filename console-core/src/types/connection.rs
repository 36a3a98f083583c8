use serde::Serialize;
use std::time::Duration;

/// State of the push-event stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before reconnect attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Consecutive failed attempts so far; zero once connected.
    pub fn backoff_attempt(&self) -> u32 {
        match self {
            Self::Reconnecting { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

/// Instance connection state reported by the gateway in `connection` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GatewayConnectionStatus {
    Open,
    Connecting,
    Closed,
    Other(String),
}

impl From<&str> for GatewayConnectionStatus {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" | "online" => Self::Open,
            "connecting" | "qrcode" | "pairing" => Self::Connecting,
            "close" | "closed" | "disconnected" | "offline" | "logout" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }
}
