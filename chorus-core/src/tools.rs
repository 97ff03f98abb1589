//! Typed tool calls and their executor.
//!
//! Tool integrations (image generation, Twitter, wallets, Notion, GitHub,
//! Vercel) live behind HTTP endpoints. A model's tool call is decoded into a
//! `ToolCall` variant with a typed input before anything is executed, so an
//! unknown name or a malformed input never reaches an endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::ToolsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    GenerateImage,
    PostTweet,
    GetWalletBalance,
    TransferToken,
    CreateNotionPage,
    CreateGithubIssue,
    DeployVercelProject,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::GenerateImage,
        ToolKind::PostTweet,
        ToolKind::GetWalletBalance,
        ToolKind::TransferToken,
        ToolKind::CreateNotionPage,
        ToolKind::CreateGithubIssue,
        ToolKind::DeployVercelProject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::GenerateImage => "generate_image",
            ToolKind::PostTweet => "post_tweet",
            ToolKind::GetWalletBalance => "get_wallet_balance",
            ToolKind::TransferToken => "transfer_token",
            ToolKind::CreateNotionPage => "create_notion_page",
            ToolKind::CreateGithubIssue => "create_github_issue",
            ToolKind::DeployVercelProject => "deploy_vercel_project",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::GenerateImage => "Generate an image from a text prompt and return its URL.",
            ToolKind::PostTweet => "Publish a tweet on the agent's account.",
            ToolKind::GetWalletBalance => "Get the native or token balance of a wallet address.",
            ToolKind::TransferToken => "Transfer tokens from the agent's wallet to an address.",
            ToolKind::CreateNotionPage => "Create a Notion page with a title and markdown content.",
            ToolKind::CreateGithubIssue => "Open an issue in a GitHub repository.",
            ToolKind::DeployVercelProject => "Trigger a production deployment of a Vercel project.",
        }
    }

    /// JSON schema of the input, in the shape chat-completion APIs expect.
    pub fn parameters(&self) -> serde_json::Value {
        match self {
            ToolKind::GenerateImage => json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                    "size": { "type": "string", "enum": ["256x256", "512x512", "1024x1024"] }
                },
                "required": ["prompt"]
            }),
            ToolKind::PostTweet => json!({
                "type": "object",
                "properties": { "text": { "type": "string", "maxLength": 280 } },
                "required": ["text"]
            }),
            ToolKind::GetWalletBalance => json!({
                "type": "object",
                "properties": {
                    "address": { "type": "string" },
                    "tokenAddress": { "type": "string" },
                    "chainId": { "type": "integer" }
                },
                "required": ["address"]
            }),
            ToolKind::TransferToken => json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string" },
                    "amount": { "type": "string" },
                    "tokenAddress": { "type": "string" },
                    "chainId": { "type": "integer" }
                },
                "required": ["to", "amount"]
            }),
            ToolKind::CreateNotionPage => json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["title", "content"]
            }),
            ToolKind::CreateGithubIssue => json!({
                "type": "object",
                "properties": {
                    "repo": { "type": "string", "description": "owner/name" },
                    "title": { "type": "string" },
                    "body": { "type": "string" }
                },
                "required": ["repo", "title"]
            }),
            ToolKind::DeployVercelProject => json!({
                "type": "object",
                "properties": { "project": { "type": "string" } },
                "required": ["project"]
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerateImageInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PostTweetInput {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletBalanceInput {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferTokenInput {
    pub to: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NotionPageInput {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GithubIssueInput {
    pub repo: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VercelDeployInput {
    pub project: String,
}

/// A decoded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "input", rename_all = "snake_case")]
pub enum ToolCall {
    GenerateImage(GenerateImageInput),
    PostTweet(PostTweetInput),
    GetWalletBalance(WalletBalanceInput),
    TransferToken(TransferTokenInput),
    CreateNotionPage(NotionPageInput),
    CreateGithubIssue(GithubIssueInput),
    DeployVercelProject(VercelDeployInput),
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid input for {tool}: {message}")]
    InvalidInput { tool: String, message: String },

    #[error("agent {agent} is not allowed to use {tool}")]
    NotPermitted { agent: String, tool: String },

    #[error("no endpoint configured for {0}")]
    NotConfigured(String),

    #[error("tool request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tool endpoint error ({code}): {message}")]
    Endpoint { code: u16, message: String },
}

impl ToolCall {
    /// Decode a model-supplied `(name, arguments)` pair. `arguments` is the raw
    /// JSON string chat-completion APIs return; an empty string means `{}`.
    pub fn decode(name: &str, arguments: &str) -> Result<Self, ToolError> {
        if ToolKind::parse(name).is_none() {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        let input: serde_json::Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| ToolError::InvalidInput {
                tool: name.to_string(),
                message: e.to_string(),
            })?
        };
        serde_json::from_value(json!({ "name": name, "input": input })).map_err(|e| {
            ToolError::InvalidInput {
                tool: name.to_string(),
                message: e.to_string(),
            }
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::GenerateImage(_) => ToolKind::GenerateImage,
            ToolCall::PostTweet(_) => ToolKind::PostTweet,
            ToolCall::GetWalletBalance(_) => ToolKind::GetWalletBalance,
            ToolCall::TransferToken(_) => ToolKind::TransferToken,
            ToolCall::CreateNotionPage(_) => ToolKind::CreateNotionPage,
            ToolCall::CreateGithubIssue(_) => ToolKind::CreateGithubIssue,
            ToolCall::DeployVercelProject(_) => ToolKind::DeployVercelProject,
        }
    }

    /// The typed input re-encoded as a JSON object.
    pub fn input_json(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(mut v) => v["input"].take(),
            Err(_) => json!({}),
        }
    }
}

/// Executes decoded tool calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError>;
}

/// Posts each call's typed input to the endpoint configured for its tool and
/// returns the response body as the tool result.
#[derive(Debug, Clone)]
pub struct HttpToolExecutor {
    client: Client,
    endpoints: HashMap<ToolKind, String>,
}

impl HttpToolExecutor {
    pub fn new(config: &ToolsConfig) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.unwrap_or(30)))
            .build()?;

        let mut endpoints = HashMap::new();
        for (name, url) in &config.endpoints {
            match ToolKind::parse(name) {
                Some(kind) => {
                    endpoints.insert(kind, url.trim_end_matches('/').to_string());
                }
                None => tracing::warn!(tool = %name, "Ignoring endpoint for unknown tool"),
            }
        }

        Ok(Self { client, endpoints })
    }

    pub fn is_configured(&self, kind: ToolKind) -> bool {
        self.endpoints.contains_key(&kind)
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let kind = call.kind();
        let url = self
            .endpoints
            .get(&kind)
            .ok_or_else(|| ToolError::NotConfigured(kind.as_str().to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&call.input_json())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::warn!(tool = kind.as_str(), code = status.as_u16(), "Tool endpoint error");
            return Err(ToolError::Endpoint {
                code: status.as_u16(),
                message: body,
            });
        }

        tracing::info!(tool = kind.as_str(), "Tool call completed");
        Ok(body)
    }
}
