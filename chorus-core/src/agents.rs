//! Agent personas and the registry the dispatch loop routes across.
//!
//! The registry is built once at startup and never mutated; callers share it
//! behind an `Arc` and pass it explicitly to whatever needs it.

use std::sync::OnceLock;

use regex::Regex;

use crate::tools::ToolKind;

/// A named persona with a fixed prompt, model and tool set.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDescriptor {
    pub name: String,
    /// Short description shown to the classifier.
    pub description: String,
    pub system_prompt: String,
    pub model: String,
    pub tools: Vec<ToolKind>,
    /// Replies are produced as a lazy chunk stream rather than one final text.
    pub streaming: bool,
}

impl AgentDescriptor {
    pub fn new(name: &str, description: &str, system_prompt: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: system_prompt.to_string(),
            model: model.to_string(),
            tools: Vec::new(),
            streaming: false,
        }
    }

    pub fn with_tools(mut self, tools: &[ToolKind]) -> Self {
        self.tools = tools.to_vec();
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn can_use(&self, tool: ToolKind) -> bool {
        self.tools.contains(&tool)
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
    classifier: AgentDescriptor,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("agent registry must contain at least one agent")]
    Empty,
    #[error("duplicate agent name: {0}")]
    Duplicate(String),
}

impl AgentRegistry {
    pub fn new(
        agents: Vec<AgentDescriptor>,
        classifier: AgentDescriptor,
    ) -> Result<Self, RegistryError> {
        if agents.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (i, agent) in agents.iter().enumerate() {
            if agents[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&agent.name))
            {
                return Err(RegistryError::Duplicate(agent.name.clone()));
            }
        }
        Ok(Self { agents, classifier })
    }

    /// The five built-in personas plus the classifier.
    pub fn standard(agent_model: &str, classifier_model: &str) -> Self {
        let agents = vec![
            AgentDescriptor::new(
                "Jaden",
                "On-chain trader. Handles wallet balances, token transfers and market talk.",
                "You are Jaden, a sharp and upbeat crypto trader. You hold a wallet on behalf of \
                 the user and can check balances or move tokens when asked. Keep replies short. \
                 When you want another agent to weigh in, start your reply with \"Hey <Name>,\".",
                agent_model,
            )
            .with_tools(&[ToolKind::GetWalletBalance, ToolKind::TransferToken]),
            AgentDescriptor::new(
                "Luna",
                "Visual artist. Generates images and shares them.",
                "You are Luna, a dreamy digital artist. You describe ideas vividly and can \
                 generate images. When you want another agent to weigh in, start your reply \
                 with \"Hey <Name>,\".",
                agent_model,
            )
            .with_tools(&[ToolKind::GenerateImage, ToolKind::PostTweet]),
            AgentDescriptor::new(
                "Atlas",
                "Software builder. Opens GitHub issues, writes docs in Notion and ships Vercel deployments.",
                "You are Atlas, a pragmatic engineer. You turn ideas into issues and \
                 deployments. When you want another agent to weigh in, start your reply with \
                 \"Hey <Name>,\".",
                agent_model,
            )
            .with_tools(&[
                ToolKind::CreateGithubIssue,
                ToolKind::CreateNotionPage,
                ToolKind::DeployVercelProject,
            ]),
            AgentDescriptor::new(
                "Sage",
                "Researcher and storyteller. Explains, summarises and thinks out loud.",
                "You are Sage, a calm researcher. You explain ideas and summarise conversations. \
                 When you want another agent to weigh in, start your reply with \"Hey <Name>,\".",
                agent_model,
            )
            .with_streaming(true),
            AgentDescriptor::new(
                "Nova",
                "Social media voice. Drafts and posts tweets.",
                "You are Nova, a witty social media manager. You write punchy posts and can \
                 publish them. When you want another agent to weigh in, start your reply with \
                 \"Hey <Name>,\".",
                agent_model,
            )
            .with_tools(&[ToolKind::PostTweet]),
        ];

        let classifier = AgentDescriptor::new(
            "classifier",
            "Selects the agent best suited to answer the latest message.",
            "You route messages in a group chat between AI agents and a user. Given the agent \
             list and the latest message, reply with only the name of the single agent who \
             should answer next.",
            classifier_model,
        );

        Self { agents, classifier }
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn classifier(&self) -> &AgentDescriptor {
        &self.classifier
    }

    /// Case-insensitive lookup by name.
    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        let name = name.trim();
        self.agents
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn default_agent(&self) -> &AgentDescriptor {
        &self.agents[0]
    }

    /// Agent named by a leading `Hey <Name>,` in `text`, if it is registered.
    pub fn addressed_in(&self, text: &str) -> Option<&AgentDescriptor> {
        static HEY: OnceLock<Regex> = OnceLock::new();
        let re = HEY.get_or_init(|| {
            Regex::new(r"^Hey ([A-Za-z][A-Za-z0-9_-]*),").expect("static regex is valid")
        });
        let caps = re.captures(text.trim_start())?;
        self.get(caps.get(1)?.as_str())
    }
}
