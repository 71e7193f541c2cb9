//! Inter-agent messaging tool (schema only).
//!
//! `send_message` is intercepted by the interaction handler and routed
//! directly through the messaging path; the executor never dispatches it.
//! The implementation below exists so the tool appears in `list_tools`
//! output with a schema agents can learn — reaching `execute` means the
//! interception was bypassed, which is reported as an error.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::agentmesh::tool_protocol::{
    AuthLevel, ParamType, Tool, ToolContext, ToolParameter, ToolResult, ToolSchema,
};

pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "send_message",
            description: "Send a message to another agent from your address book.",
            summary: "Inter-agent messaging.",
            auth_level: AuthLevel::Worker,
            parameters: vec![
                ToolParameter {
                    name: "target_agent_id",
                    param_type: ParamType::String,
                    required: true,
                    description: "Recipient agent id (or exact persona).",
                },
                ToolParameter {
                    name: "message_content",
                    param_type: ParamType::String,
                    required: true,
                    description: "Message body.",
                },
            ],
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        _args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        Ok(ToolResult::error(
            "send_message is routed by the framework and must not be dispatched as a tool.",
        ))
    }
}
