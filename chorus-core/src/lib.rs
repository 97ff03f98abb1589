pub mod agents;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod protocol;
pub mod tools;

pub use agents::{AgentDescriptor, AgentRegistry};
pub use config::ChorusConfig;
pub use error::ChorusError;
pub use llm::{AgentRouter, LlmError, LlmRouter, RouteOutcome, RouteOutput, RouteRequest};
pub use models::{ChatMessage, ChatMode, DispatchPayload};
pub use tools::{HttpToolExecutor, ToolCall, ToolExecutor, ToolKind};
