pub mod backoff;
pub mod framing;
pub mod jid;
pub mod net;
pub mod proto;
pub mod store;
pub mod types;
