//! UI event broadcast.
//!
//! The runtime reports everything observable to the outside world through a
//! one-way stream of [`UiEvent`]s. Transports (websockets, log tailers, test
//! collectors) implement [`UiSink`]; the manager broadcasts fire-and-forget
//! to every registered sink and lazily prunes the ones that report
//! disconnection.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::event::{UiEvent, UiSink};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl UiSink for Printer {
//!     async fn send(&self, event: &UiEvent) -> bool {
//!         println!("{:?}", event);
//!         true
//!     }
//! }
//! ```

use async_trait::async_trait;

/// One UI broadcast event.
///
/// Variants mirror the runtime's observable moments; every variant carries
/// enough identifiers for the UI to attribute the event without extra state.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Agent execution status changed (idle/processing/…).
    AgentStatusUpdate {
        agent_id: String,
        status: String,
        detail: Option<String>,
    },
    /// Agent workflow state changed.
    AgentStateChange {
        agent_id: String,
        old_state: String,
        new_state: String,
        message: String,
    },
    /// A tool finished executing on behalf of an agent.
    ToolResult {
        agent_id: String,
        tool_name: String,
        call_id: String,
        status: String,
        message: String,
    },
    /// The guardian raised a concern about a final response.
    CgConcern {
        agent_id: String,
        original_text: String,
        concern_details: String,
    },
    /// A project was created and its PM awaits user approval.
    ProjectPendingApproval {
        project_name: String,
        pm_agent_id: String,
        plan_preview: String,
    },
    /// The user approved a pending project.
    ProjectApproved {
        project_name: String,
        pm_agent_id: String,
    },
    /// An agent's history was condensed by the context summarizer.
    ContextSummarization {
        agent_id: String,
        original_messages: usize,
        condensed_messages: usize,
    },
    /// Malformed XML tool calls were repaired and executed.
    XmlRecoverySuccess {
        agent_id: String,
        recovered_calls: usize,
        applied_fixes: Vec<String>,
    },
    /// Free-form framework notification.
    SystemNotification { agent_id: Option<String>, content: String },
    /// The periodic contaminated-history sweep removed messages.
    AutomaticContaminatedCleanup {
        messages_removed: usize,
        records_removed: usize,
    },
    /// An error the UI should surface.
    Error {
        agent_id: Option<String>,
        content: String,
    },
}

impl UiEvent {
    /// Wire-format tag for this event, stable across releases.
    pub fn type_tag(&self) -> &'static str {
        match self {
            UiEvent::AgentStatusUpdate { .. } => "agent_status_update",
            UiEvent::AgentStateChange { .. } => "agent_state_change",
            UiEvent::ToolResult { .. } => "tool_result",
            UiEvent::CgConcern { .. } => "cg_concern",
            UiEvent::ProjectPendingApproval { .. } => "project_pending_approval",
            UiEvent::ProjectApproved { .. } => "project_approved",
            UiEvent::ContextSummarization { .. } => "context_summarization",
            UiEvent::XmlRecoverySuccess { .. } => "xml_recovery_success",
            UiEvent::SystemNotification { .. } => "system_notification",
            UiEvent::AutomaticContaminatedCleanup { .. } => "automatic_contaminated_cleanup",
            UiEvent::Error { .. } => "error",
        }
    }
}

/// One UI transport endpoint.
///
/// `send` returns `false` when the sink is disconnected; the manager drops
/// such sinks on the next broadcast. Implementations must not block — slow
/// consumers should buffer internally.
#[async_trait]
pub trait UiSink: Send + Sync {
    async fn send(&self, event: &UiEvent) -> bool;
}
