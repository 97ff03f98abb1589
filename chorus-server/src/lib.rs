pub mod auth;
pub mod delivery;
pub mod http;
pub mod queue;
pub mod router;
pub mod server;
pub mod store;
pub mod subsystems;
