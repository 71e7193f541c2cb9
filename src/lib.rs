// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-exporting key items for easier external access.
pub use agentmesh::agent::{Agent, AgentKind, AgentStatus, Message, MessageRole};
pub use agentmesh::config::{ModelTier, Settings};
pub use agentmesh::manager::AgentManager;
pub use agentmesh::provider::{CompletionRequest, ProviderAdapter, StreamEvent};

// Flattened module aliases so downstream code can write `agentmesh::event::UiEvent`.
pub use agentmesh::agent;
pub use agentmesh::{
    config, cycle, event, failover, guardian, health, interaction, interaction_log, key_manager,
    manager, model_registry, performance, prompts, provider, session, state, summarizer,
    tool_protocol, tools, workflow, xml_parser,
};
