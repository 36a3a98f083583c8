use std::time::Duration;
use thiserror::Error;
use whatsapp_console_core::proto::ProtoError;
use whatsapp_console_core::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode gateway response: {0}")]
    Decode(#[from] ProtoError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// 401/403: the instance token is no longer accepted.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("no instance selected")]
    NoInstance,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("message has no sendable content")]
    EmptyMessage,
    #[error("unsupported media payload: {0}")]
    InvalidMedia(String),
}
