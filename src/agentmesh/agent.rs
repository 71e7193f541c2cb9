//! Core agent model.
//!
//! This module defines the [`Agent`] record — one addressable reasoning unit
//! bound to a provider/model with a per-kind state machine — together with the
//! message model its history is made of.
//!
//! Agents are created by the [`AgentManager`](crate::agentmesh::manager::AgentManager)
//! either from a configuration snapshot at startup (the bootstrap admin and the
//! guardian) or dynamically through the `manage_team` tool. They are mutated
//! only by the cycle engine, the interaction handler, the workflow manager and
//! the health monitor, and destroyed only through `delete_agent` (never the
//! bootstrap agents).
//!
//! # Invariants
//!
//! - At most one in-flight cycle per agent (enforced by the manager's
//!   scheduler, see [`AgentManager::schedule_cycle`](crate::agentmesh::manager::AgentManager::schedule_cycle)).
//! - `state` is always a member of the legal state set for the agent's kind
//!   ([`WorkflowManager`](crate::agentmesh::workflow::WorkflowManager) validates
//!   every transition).
//! - `message_history[0]` is the system prompt whenever one is present.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable identifier of the bootstrap admin agent.
///
/// The admin is created at startup from configuration and is never deleted at
/// runtime; inter-agent routing treats it as universally reachable.
pub const BOOTSTRAP_ADMIN_ID: &str = "admin_ai";

/// Stable identifier of the guardian agent.
///
/// The guardian reviews final responses against the governance principles and
/// produces context summaries. Like the admin it is a bootstrap agent and is
/// exempt from health interventions.
pub const GUARDIAN_AGENT_ID: &str = "guardian";

/// The closed set of agent kinds known to the runtime.
///
/// Workflow rules, prompt selection and the address book are all keyed by
/// kind; the per-kind state sets are closed, which is why `state` can stay a
/// plain string on [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// The user-facing coordinator. Receives user messages, plans projects,
    /// and delegates to project managers.
    Admin,
    /// A project manager bound to one project: builds a worker team, assigns
    /// tasks, and supervises progress.
    Pm,
    /// A worker executing tasks assigned by its PM.
    Worker,
    /// The reviewing/summarizing agent. Never part of a team.
    Guardian,
}

impl AgentKind {
    /// Canonical lowercase name used in logs, persisted records and prompt
    /// template keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Admin => "admin",
            AgentKind::Pm => "pm",
            AgentKind::Worker => "worker",
            AgentKind::Guardian => "guardian",
        }
    }

    /// Parse the canonical name back into a kind.
    pub fn parse(s: &str) -> Option<AgentKind> {
        match s {
            "admin" => Some(AgentKind::Admin),
            "pm" => Some(AgentKind::Pm),
            "worker" => Some(AgentKind::Worker),
            "guardian" => Some(AgentKind::Guardian),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of an agent, orthogonal to its workflow `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No cycle in flight; the agent can be scheduled.
    Idle,
    /// A cycle is streaming from the LLM.
    Processing,
    /// A tool invocation is running on the agent's behalf.
    ExecutingTool,
    /// Waiting on an out-of-band tool completion.
    AwaitingTool,
    /// Final response handed to the guardian, verdict pending.
    AwaitingCgReview,
    /// Guardian raised a concern; paused until the user approves or overrides.
    AwaitingUserReviewCg,
    /// The agent hit an unrecoverable cycle error and is parked.
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Processing => "processing",
            AgentStatus::ExecutingTool => "executing_tool",
            AgentStatus::AwaitingTool => "awaiting_tool",
            AgentStatus::AwaitingCgReview => "awaiting_cg_review",
            AgentStatus::AwaitingUserReviewCg => "awaiting_user_review_cg",
            AgentStatus::Error => "error",
        }
    }

    /// Paused statuses reject new work entirely: inbound messages are queued
    /// into history but no cycle may be scheduled and no priority recheck is
    /// flagged.
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            AgentStatus::AwaitingUserReviewCg | AgentStatus::AwaitingCgReview
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role tag of one history message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    SystemError,
    SystemIntervention,
    AgentStateChange,
    SystemFrameworkNotification,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::SystemError => "system_error",
            MessageRole::SystemIntervention => "system_intervention",
            MessageRole::AgentStateChange => "agent_state_change",
            MessageRole::SystemFrameworkNotification => "system_framework_notification",
        }
    }
}

/// One tool call as requested by the LLM within an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Call correlation id. Either provider-assigned or synthesized from a
    /// UUID when the call was parsed out of raw XML.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Parsed arguments as a JSON object.
    pub arguments: serde_json::Value,
}

/// A single message in an agent's history.
///
/// Histories are append-only: no code path edits a message in place. The only
/// wholesale replacement is context summarization, which swaps the entire
/// list, and the health monitor's contaminated-history cleanup, which removes
/// whole messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    /// Body text. `None` only for assistant messages that carry nothing but
    /// tool calls.
    pub content: Option<String>,
    /// Tool calls attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Correlates a `Tool` message back to the assistant call that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on `Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message that carries tool calls (content may be empty).
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Message {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Result of a tool execution, correlated to `call_id`.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    /// Typed framework message with one of the `system_*` roles.
    pub fn framework(role: MessageRole, content: impl Into<String>) -> Self {
        Message {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Body text, or `""` when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Per-agent bookkeeping for the failover handler.
///
/// Tracks which (provider, model) combinations have already failed so the
/// failover handler never retries a combination within the same failure
/// episode. Cleared when a cycle completes successfully.
#[derive(Debug, Clone, Default)]
pub struct FailoverState {
    /// Model ids already tried against the currently active external key.
    pub tried_models_on_current_external_key: HashSet<String>,
    /// Per local provider: model ids already tried.
    pub tried_models_per_local_provider: HashMap<String, HashSet<String>>,
    /// Fingerprints of external keys already exhausted for the provider.
    pub tried_external_keys_for_provider: HashSet<String>,
}

impl FailoverState {
    /// Forget everything tried under the previous key after a key rotation.
    pub fn clear_current_key_models(&mut self) {
        self.tried_models_on_current_external_key.clear();
    }

    /// Full reset after a successful cycle.
    pub fn reset(&mut self) {
        self.tried_models_on_current_external_key.clear();
        self.tried_models_per_local_provider.clear();
        self.tried_external_keys_for_provider.clear();
    }
}

/// Details preserved when the guardian raises a concern about a final
/// response, so the UI can show both sides and let the user decide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgConcern {
    /// The agent's original final-response text.
    pub original_text: String,
    /// The guardian's concern body (the text inside `<CONCERN>…</CONCERN>`).
    pub concern_details: String,
}

/// Simplified view of one unassigned task, held by a PM while walking the
/// activate-workers assignment flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_uuid: String,
    pub description: String,
}

/// One addressable reasoning unit.
///
/// All mutable runtime state lives here; the manager stores agents as
/// `Arc<RwLock<Agent>>` and the cycle task is the single writer while a cycle
/// is in flight (external parties only append messages and set
/// `needs_priority_recheck`).
#[derive(Debug)]
pub struct Agent {
    /// Stable identifier, unique within the registry.
    pub agent_id: String,
    pub kind: AgentKind,
    /// Human-readable display name, also used for persona-based routing.
    pub persona: String,
    /// Current provider binding; switched by the failover handler.
    pub provider_name: String,
    /// Current model binding; switched by the failover handler.
    pub model_id: String,
    pub temperature: f32,
    /// Workflow state, always legal for `kind`.
    pub state: String,
    pub status: AgentStatus,
    pub message_history: Vec<Message>,
    /// Filesystem root for this agent's file-system tool operations.
    pub sandbox_path: PathBuf,
    /// Project the agent is bound to (PMs and workers).
    pub project_name: Option<String>,

    // Ephemeral runtime fields, never persisted.
    /// Set when a message arrived while a cycle was in flight; makes the
    /// cycle restart its turn before exiting.
    pub needs_priority_recheck: bool,
    pub failover: FailoverState,
    /// Key the in-flight (or last) cycle authenticated with; quarantined on
    /// key-related failures.
    pub current_api_key: Option<String>,
    /// Personality text from configuration, merged into admin prompts.
    pub config_system_prompt: Option<String>,
    /// PM build-team progress counter.
    pub created_agent_count_for_build: u32,
    /// PM build-team target; falls back to `max_workers_per_pm` when unset.
    pub target_worker_agents_for_build: Option<u32>,
    /// Set when a PM enters `manage` so its first cycle starts with a
    /// mandatory tool listing.
    pub pm_needs_initial_list_tools: bool,
    /// PMs created via `create_project_and_pm_agent` stay unscheduled until
    /// the user approves the project.
    pub awaiting_project_approval: bool,
    /// Successive failed tool executions (3-strike guard for PMs).
    pub consecutive_tool_failures: u32,
    /// Successive PM `manage` cycles that produced thought but no action.
    pub manage_unproductive_cycles: u32,
    /// Unassigned-task summary captured after `list_tasks` in
    /// `activate_workers`.
    pub unassigned_task_summary: Option<Vec<TaskSummary>>,
    /// Present while paused in `awaiting_user_review_cg`.
    pub cg_concern: Option<CgConcern>,
    /// Project plan text a PM was created with.
    pub plan_description: Option<String>,
}

impl Agent {
    /// Create an idle agent in its kind's `startup` state (the guardian goes
    /// straight to `ready`).
    pub fn new(
        agent_id: impl Into<String>,
        kind: AgentKind,
        persona: impl Into<String>,
        provider_name: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let initial_state = match kind {
            AgentKind::Guardian => "ready",
            _ => "startup",
        };
        Agent {
            agent_id: agent_id.into(),
            kind,
            persona: persona.into(),
            provider_name: provider_name.into(),
            model_id: model_id.into(),
            temperature: 0.7,
            state: initial_state.to_string(),
            status: AgentStatus::Idle,
            message_history: Vec::new(),
            sandbox_path: PathBuf::from("."),
            project_name: None,
            needs_priority_recheck: false,
            failover: FailoverState::default(),
            current_api_key: None,
            config_system_prompt: None,
            created_agent_count_for_build: 0,
            target_worker_agents_for_build: None,
            pm_needs_initial_list_tools: false,
            awaiting_project_approval: false,
            consecutive_tool_failures: 0,
            manage_unproductive_cycles: 0,
            unassigned_task_summary: None,
            cg_concern: None,
            plan_description: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_sandbox(mut self, sandbox_path: impl Into<PathBuf>) -> Self {
        self.sandbox_path = sandbox_path.into();
        self
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    pub fn with_config_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config_system_prompt = Some(prompt.into());
        self
    }

    /// Bootstrap agents (the admin and the guardian) are never deleted and
    /// never targeted by health interventions or `set_agent_state`.
    pub fn is_bootstrap(&self) -> bool {
        self.agent_id == BOOTSTRAP_ADMIN_ID || self.agent_id == GUARDIAN_AGENT_ID
    }

    /// Replace or insert the leading system prompt so that
    /// `message_history[0]` is the system message.
    pub fn set_system_prompt(&mut self, prompt: String) {
        match self.message_history.first() {
            Some(m) if m.role == MessageRole::System => {
                self.message_history[0] = Message::system(prompt);
            }
            _ => self.message_history.insert(0, Message::system(prompt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_defaults() {
        let agent = Agent::new("w1", AgentKind::Worker, "Coder", "ollama-local", "llama3");
        assert_eq!(agent.state, "startup");
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.message_history.is_empty());
        assert!(!agent.is_bootstrap());
    }

    #[test]
    fn test_guardian_starts_ready() {
        let agent = Agent::new(
            GUARDIAN_AGENT_ID,
            AgentKind::Guardian,
            "Guardian",
            "ollama-local",
            "llama3",
        );
        assert_eq!(agent.state, "ready");
        assert!(agent.is_bootstrap());
    }

    #[test]
    fn test_set_system_prompt_replaces_head() {
        let mut agent = Agent::new("a", AgentKind::Admin, "Admin", "p", "m");
        agent.message_history.push(Message::user("hello"));
        agent.set_system_prompt("first".into());
        assert_eq!(agent.message_history[0].role, MessageRole::System);
        assert_eq!(agent.message_history[0].text(), "first");
        assert_eq!(agent.message_history.len(), 2);

        agent.set_system_prompt("second".into());
        assert_eq!(agent.message_history[0].text(), "second");
        assert_eq!(agent.message_history.len(), 2);
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let msg = Message::tool_result("call_1", "file_system", "{\"status\":\"success\"}");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, MessageRole::Tool);
        assert_eq!(back.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(back.name.as_deref(), Some("file_system"));
    }
}
