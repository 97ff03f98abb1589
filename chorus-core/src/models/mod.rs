pub mod connection;
pub mod message;
pub mod payload;
pub mod request;
pub mod wallet;

pub use connection::Connection;
pub use message::ChatMessage;
pub use payload::{ChatMode, DispatchPayload};
pub use request::{AgentRequest, RequestStatus};
pub use wallet::AgentWallet;

/// Unix seconds `days` after `now`, used for the `ttl` column of expiring records.
pub fn ttl_after(now: chrono::DateTime<chrono::Utc>, days: i64) -> i64 {
    (now + chrono::Duration::days(days)).timestamp()
}
