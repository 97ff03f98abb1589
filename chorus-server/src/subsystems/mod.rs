pub mod consumer;
pub mod dispatch;
pub mod reaper;
