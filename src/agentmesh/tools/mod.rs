//! Concrete tool implementations.
//!
//! Each tool lives in its own file and registers through
//! [`ToolExecutor::register`](crate::agentmesh::tool_protocol::ToolExecutor::register).
//! `send_message` is schema-only (the interaction handler intercepts it
//! before dispatch) and `manage_team` returns handler signals rather than
//! acting on the registry itself.

pub mod file_system;
pub mod knowledge_base;
pub mod manage_team;
pub mod project_management;
pub mod send_message;

pub use file_system::FileSystemTool;
pub use knowledge_base::KnowledgeBaseTool;
pub use manage_team::ManageTeamTool;
pub use project_management::ProjectManagementTool;
pub use send_message::SendMessageTool;
