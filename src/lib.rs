// Re-export core modules so consumers only depend on this crate
pub use whatsapp_console_core::{backoff, framing, jid, net, proto, store};

// Core types are re-exported, but events (with EventBus) remain here for runtime-specific functionality
pub mod types {
    pub use whatsapp_console_core::types::*;
    pub mod events;
}

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod profile_cache;
pub(crate) mod state;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{ClientConfig, InstanceCredentials};
pub use console::ChatConsole;
pub use error::{ConsoleError, GatewayError};
pub use types::events::{Event, EventBus, EventHandler};
