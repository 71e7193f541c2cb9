//! Team and agent lifecycle tool.
//!
//! `manage_team` only validates its arguments and emits a signal result; the
//! interaction handler owns the real registry/team mutations because they
//! need manager context (agent creation, scheduling, team bookkeeping) that
//! tools deliberately do not get.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::agentmesh::tool_protocol::{
    AuthLevel, ParamType, Tool, ToolContext, ToolParameter, ToolResult, ToolSchema,
};

const ACTIONS: &[&str] = &[
    "create_agent",
    "delete_agent",
    "create_team",
    "delete_team",
    "add_agent_to_team",
    "remove_agent_from_team",
    "list_agents",
    "list_teams",
    "get_agent_details",
    "set_agent_state",
];

pub struct ManageTeamTool;

#[async_trait]
impl Tool for ManageTeamTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "manage_team",
            description: "Create and manage agents and teams: create_agent, delete_agent, \
                          create_team, delete_team, add_agent_to_team, remove_agent_from_team, \
                          list_agents, list_teams, get_agent_details, set_agent_state.",
            summary: "Agent and team lifecycle management.",
            auth_level: AuthLevel::Pm,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "One of the manage_team actions.",
                },
                ToolParameter {
                    name: "agent_id",
                    param_type: ParamType::String,
                    required: false,
                    description: "Target agent id (delete/add/remove/details/set_state).",
                },
                ToolParameter {
                    name: "team_id",
                    param_type: ParamType::String,
                    required: false,
                    description: "Target team id.",
                },
                ToolParameter {
                    name: "persona",
                    param_type: ParamType::String,
                    required: false,
                    description: "Display name for a created agent.",
                },
                ToolParameter {
                    name: "provider",
                    param_type: ParamType::String,
                    required: false,
                    description: "Provider for a created agent (defaults to the creator's).",
                },
                ToolParameter {
                    name: "model",
                    param_type: ParamType::String,
                    required: false,
                    description: "Model for a created agent (defaults to the creator's).",
                },
                ToolParameter {
                    name: "system_prompt",
                    param_type: ParamType::String,
                    required: false,
                    description: "Personality text for a created agent.",
                },
                ToolParameter {
                    name: "temperature",
                    param_type: ParamType::Float,
                    required: false,
                    description: "Sampling temperature for a created agent.",
                },
                ToolParameter {
                    name: "state",
                    param_type: ParamType::String,
                    required: false,
                    description: "Requested state for set_agent_state.",
                },
            ],
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        let action = match args.get("action") {
            Some(action) if !action.is_empty() => action.as_str(),
            _ => return Ok(ToolResult::error("manage_team requires an action parameter.")),
        };
        if !ACTIONS.iter().any(|a| *a == action) {
            return Ok(ToolResult::error(format!(
                "Unrecognized manage_team action '{}'. Valid actions: {}.",
                action,
                ACTIONS.join(", ")
            )));
        }

        // Argument presence checks per action; the handler performs the work.
        match action {
            "create_agent" => {
                if args.get("persona").map_or(true, |p| p.is_empty()) {
                    return Ok(ToolResult::error("create_agent requires a persona parameter."));
                }
            }
            "delete_agent" | "get_agent_details" => {
                if args.get("agent_id").map_or(true, |a| a.is_empty()) {
                    return Ok(ToolResult::error(format!(
                        "{} requires an agent_id parameter.",
                        action
                    )));
                }
            }
            "create_team" | "delete_team" => {
                if args.get("team_id").map_or(true, |t| t.is_empty()) {
                    return Ok(ToolResult::error(format!(
                        "{} requires a team_id parameter.",
                        action
                    )));
                }
            }
            "add_agent_to_team" | "remove_agent_from_team" => {
                if args.get("agent_id").map_or(true, |a| a.is_empty())
                    || args.get("team_id").map_or(true, |t| t.is_empty())
                {
                    return Ok(ToolResult::error(format!(
                        "{} requires agent_id and team_id parameters.",
                        action
                    )));
                }
            }
            "set_agent_state" => {
                if args.get("agent_id").map_or(true, |a| a.is_empty())
                    || args.get("state").map_or(true, |s| s.is_empty())
                {
                    return Ok(ToolResult::error(
                        "set_agent_state requires agent_id and state parameters.",
                    ));
                }
            }
            _ => {}
        }

        let params: serde_json::Map<String, serde_json::Value> = args
            .iter()
            .filter(|(k, _)| k.as_str() != "action")
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        Ok(ToolResult::signal(
            action,
            serde_json::Value::Object(params),
            format!("manage_team action '{}' validated.", action),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::agent::AgentKind;
    use crate::agentmesh::tool_protocol::ToolStatus;
    use std::path::PathBuf;

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "pm1".to_string(),
            agent_kind: AgentKind::Pm,
            sandbox_path: PathBuf::from("/tmp"),
            project: Some("demo".to_string()),
            session: Some("s1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_valid_action_signals_handler() {
        let tool = ManageTeamTool;
        let mut args = HashMap::new();
        args.insert("action".to_string(), "create_team".to_string());
        args.insert("team_id".to_string(), "t1".to_string());
        let result = tool.execute(&ctx(), &args).await.unwrap();
        assert_eq!(result.status, ToolStatus::SuccessSignalToHandler);
        assert_eq!(result.data["action_to_perform"], "create_team");
        assert_eq!(result.data["action_params"]["team_id"], "t1");
    }

    #[tokio::test]
    async fn test_missing_args_rejected() {
        let tool = ManageTeamTool;
        let mut args = HashMap::new();
        args.insert("action".to_string(), "create_agent".to_string());
        let result = tool.execute(&ctx(), &args).await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);

        args.insert("action".to_string(), "explode".to_string());
        let result = tool.execute(&ctx(), &args).await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);
    }
}
