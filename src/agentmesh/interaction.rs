//! Inter-agent messaging and tool interaction handling.
//!
//! This module owns the paths between the cycle engine and the rest of the
//! population:
//!
//! - routing `send_message` calls between agents (with team policy and
//!   persona resolution),
//! - executing parsed tool calls and recording their results in history,
//! - performing the team-management actions that the `manage_team` tool
//!   validated and signalled back,
//! - the state-specific directives injected after a successful tool call
//!   (PM build-team progression, worker activation after task assignment,
//!   PM manage/standby nudges),
//! - the worker auto-save pass over final responses.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use serde_json::json;

use crate::agentmesh::agent::{
    Agent, AgentKind, AgentStatus, Message, MessageRole, TaskSummary, BOOTSTRAP_ADMIN_ID,
};
use crate::agentmesh::manager::AgentManager;
use crate::agentmesh::event::UiEvent;
use crate::agentmesh::tool_protocol::{ToolContext, ToolResult, ToolStatus};

lazy_static! {
    static ref CODE_BLOCK_RE: Regex = Regex::new(r"(?s)```[A-Za-z0-9_]*\n(.*?)```").unwrap();
    static ref FILE_COMMENT_RE: Regex =
        Regex::new(r"^(?:#|//|<!--)\s*file:\s*([\w\-\./]+)\s*(?:-->)?\s*$").unwrap();
}

/// Successive failed tool executions that force a PM into error status.
const PM_TOOL_FAILURE_LIMIT: u32 = 3;

/// One executed tool call, retained for the post-tool intervention pass.
#[derive(Debug, Clone)]
pub struct ExecutedTool {
    pub call_id: String,
    pub tool_name: String,
    pub args: HashMap<String, String>,
    pub result: ToolResult,
}

impl ExecutedTool {
    pub fn action(&self) -> Option<&str> {
        self.args.get("action").map(String::as_str)
    }
}

/// Route a message from `sender_id` to `target_identifier` and activate the
/// target as its status allows.
///
/// Resolution is by exact agent id first, then by unique persona match. The
/// routing policy permits a message iff the sender is the admin, the target
/// is the admin, or both share a team; everything else feeds a blocked
/// notice back into the sender's history instead of raising.
pub async fn route_and_activate_agent_message(
    manager: &Arc<AgentManager>,
    sender_id: &str,
    target_identifier: &str,
    content: &str,
) {
    let sender = match manager.get_agent(sender_id).await {
        Some(sender) => sender,
        None => {
            warn!("send_message from unknown sender '{}'", sender_id);
            return;
        }
    };

    // Resolve the target: exact id, then unique persona.
    let mut target = manager.get_agent(target_identifier).await;
    let mut resolved_id = target_identifier.to_string();
    if target.is_none() {
        let directory = manager.directory_snapshot().await;
        let persona_matches: Vec<&crate::agentmesh::workflow::AgentDirectoryEntry> = directory
            .iter()
            .filter(|e| e.persona.eq_ignore_ascii_case(target_identifier))
            .collect();
        match persona_matches.len() {
            1 => {
                resolved_id = persona_matches[0].agent_id.clone();
                target = manager.get_agent(&resolved_id).await;
            }
            0 => {}
            _ => {
                let feedback = format!(
                    "[Framework Feedback for send_message]: Persona '{}' is ambiguous ({} agents match). Use an exact agent id.",
                    target_identifier,
                    persona_matches.len()
                );
                sender.write().await.message_history.push(Message::tool_result(
                    format!("send_message_failed_{}", target_identifier),
                    "send_message",
                    feedback,
                ));
                return;
            }
        }
    }

    let target = match target {
        Some(target) => target,
        None => {
            let feedback = format!(
                "[Framework Feedback for send_message]: Target agent '{}' not found.",
                target_identifier
            );
            sender.write().await.message_history.push(Message::tool_result(
                format!("send_message_failed_{}", target_identifier),
                "send_message",
                feedback,
            ));
            return;
        }
    };

    // Routing policy.
    let (sender_team, target_team) = {
        let teams = manager.teams.lock().await;
        (
            teams.team_of(sender_id).map(String::from),
            teams.team_of(&resolved_id).map(String::from),
        )
    };
    let allowed = sender_id == BOOTSTRAP_ADMIN_ID
        || resolved_id == BOOTSTRAP_ADMIN_ID
        || (sender_team.is_some() && sender_team == target_team);
    if !allowed {
        let feedback = format!(
            "[Framework Feedback for send_message]: Message blocked: sender '{}' (team: {}) cannot send to '{}' (team: {}).",
            sender_id,
            sender_team.as_deref().unwrap_or("N/A"),
            resolved_id,
            target_team.as_deref().unwrap_or("N/A")
        );
        warn!("Communication blocked: {} -> {}", sender_id, resolved_id);
        sender.write().await.message_history.push(Message::tool_result(
            format!("send_message_failed_{}", resolved_id),
            "send_message",
            feedback,
        ));
        return;
    }

    // Deliver.
    let sender_persona = sender.read().await.persona.clone();
    let formatted = format!("[From @{} ({})]: {}", sender_id, sender_persona, content);
    let target_status = {
        let mut target_guard = target.write().await;
        target_guard.message_history.push(Message::user(formatted.clone()));
        target_guard.status
    };
    manager
        .log_interaction(&resolved_id, MessageRole::User, &formatted, None, None)
        .await;

    match target_status {
        AgentStatus::Idle => {
            manager.schedule_cycle(&resolved_id, 0).await;
        }
        AgentStatus::Error => {
            target.write().await.status = AgentStatus::Idle;
            manager.schedule_cycle(&resolved_id, 0).await;
        }
        status if status.is_paused() => {
            manager
                .send_to_ui(UiEvent::AgentStatusUpdate {
                    agent_id: resolved_id.clone(),
                    status: status.as_str().to_string(),
                    detail: Some(format!("Message from @{} queued.", sender_id)),
                })
                .await;
        }
        _ => {
            target.write().await.needs_priority_recheck = true;
        }
    }
}

/// Execute one parsed tool call for `agent_id` and record the result.
///
/// `send_message` is intercepted and routed directly; team-management
/// signals are resolved into their real actions before the result is
/// recorded. The returned [`ExecutedTool`] carries the final (post-signal)
/// result.
pub async fn execute_single_tool(
    manager: &Arc<AgentManager>,
    agent_id: &str,
    call_id: &str,
    tool_name: &str,
    args: HashMap<String, String>,
) -> Option<ExecutedTool> {
    let agent = manager.get_agent(agent_id).await?;

    // send_message bypasses the executor entirely.
    if tool_name == "send_message" {
        let target = args.get("target_agent_id").cloned().unwrap_or_default();
        let content = args.get("message_content").cloned().unwrap_or_default();
        let result = if target.is_empty() || content.is_empty() {
            ToolResult::error("send_message requires target_agent_id and message_content.")
        } else {
            route_and_activate_agent_message(manager, agent_id, &target, &content).await;
            ToolResult::success(format!("Message dispatched to '{}'.", target))
        };
        record_tool_result(manager, &agent, agent_id, call_id, tool_name, &result).await;
        return Some(ExecutedTool {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            result,
        });
    }

    let (kind, sandbox) = {
        let mut guard = agent.write().await;
        guard.status = AgentStatus::ExecutingTool;
        (guard.kind, guard.sandbox_path.clone())
    };
    manager
        .send_to_ui(UiEvent::AgentStatusUpdate {
            agent_id: agent_id.to_string(),
            status: AgentStatus::ExecutingTool.as_str().to_string(),
            detail: Some(tool_name.to_string()),
        })
        .await;

    let (project, session) = manager.active_context().await;
    let ctx = ToolContext {
        agent_id: agent_id.to_string(),
        agent_kind: kind,
        sandbox_path: sandbox,
        project: {
            // PMs and workers operate on their own project when bound.
            let bound = agent.read().await.project_name.clone();
            bound.or(project)
        },
        session,
    };
    let mut result = manager.tool_executor.execute_tool(&ctx, tool_name, &args).await;

    // Team-management signals: the executor validated, we act.
    if result.status == ToolStatus::SuccessSignalToHandler {
        let action = result.data["action_to_perform"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let params = result.data["action_params"].clone();
        result = handle_manage_team_action(manager, agent_id, &action, &params).await;
    }

    {
        let mut guard = agent.write().await;
        if guard.status == AgentStatus::ExecutingTool {
            guard.status = AgentStatus::Processing;
        }
        if result.is_success() {
            guard.consecutive_tool_failures = 0;
        } else {
            guard.consecutive_tool_failures += 1;
        }
    }

    record_tool_result(manager, &agent, agent_id, call_id, tool_name, &result).await;

    // 3-strike guard: a PM that keeps failing tools is parked.
    let strike_out = {
        let guard = agent.read().await;
        guard.kind == AgentKind::Pm && guard.consecutive_tool_failures >= PM_TOOL_FAILURE_LIMIT
    };
    if strike_out {
        let mut guard = agent.write().await;
        guard.status = AgentStatus::Error;
        guard.message_history.push(Message::framework(
            MessageRole::SystemError,
            format!(
                "[Framework Notice]: {} successive tool executions failed. The agent has been \
                 placed in error status pending review.",
                PM_TOOL_FAILURE_LIMIT
            ),
        ));
        warn!("PM '{}' hit the consecutive tool failure limit", agent_id);
    }

    Some(ExecutedTool {
        call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        args,
        result,
    })
}

async fn record_tool_result(
    manager: &Arc<AgentManager>,
    agent: &Arc<tokio::sync::RwLock<Agent>>,
    agent_id: &str,
    call_id: &str,
    tool_name: &str,
    result: &ToolResult,
) {
    let content = result.to_json().to_string();
    agent
        .write()
        .await
        .message_history
        .push(Message::tool_result(call_id, tool_name, content.clone()));
    manager
        .log_interaction(
            agent_id,
            MessageRole::Tool,
            &content,
            None,
            Some(result.to_json()),
        )
        .await;
    manager
        .send_to_ui(UiEvent::ToolResult {
            agent_id: agent_id.to_string(),
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            status: result.status.as_str().to_string(),
            message: result.message.clone(),
        })
        .await;
}

fn param<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Perform a validated `manage_team` action on the live registry/teams.
pub async fn handle_manage_team_action(
    manager: &Arc<AgentManager>,
    calling_agent_id: &str,
    action: &str,
    params: &serde_json::Value,
) -> ToolResult {
    match action {
        "create_agent" => {
            let persona = param(params, "persona").unwrap_or("Worker");
            let creator_team = {
                let teams = manager.teams.lock().await;
                teams.team_of(calling_agent_id).map(String::from)
            };
            let team_id = param(params, "team_id").map(String::from).or(creator_team);
            match manager
                .create_agent_instance(
                    persona,
                    param(params, "provider"),
                    param(params, "model"),
                    param(params, "system_prompt"),
                    params.get("temperature").and_then(|v| {
                        v.as_str().and_then(|s| s.parse::<f32>().ok()).or(v.as_f64().map(|f| f as f32))
                    }),
                    team_id.as_deref(),
                    Some(calling_agent_id),
                )
                .await
            {
                Ok(created_id) => ToolResult::success_with(
                    format!("Agent '{}' created (persona '{}').", created_id, persona),
                    json!({
                        "action": "create_agent",
                        "created_agent_id": created_id,
                        "persona": persona,
                        "team_id": team_id,
                    }),
                ),
                Err(e) => ToolResult::error(e),
            }
        }
        "delete_agent" => {
            let agent_id = param(params, "agent_id").unwrap_or_default();
            match manager.delete_agent_instance(agent_id).await {
                Ok(message) => ToolResult::success(message),
                Err(e) => ToolResult::error(e),
            }
        }
        "create_team" => {
            let team_id = param(params, "team_id").unwrap_or_default();
            let outcome = manager.teams.lock().await.create_team(team_id);
            match outcome {
                Ok(message) => ToolResult::success_with(
                    message,
                    json!({ "action": "create_team", "created_team_id": team_id }),
                ),
                Err(e) => ToolResult::error(e),
            }
        }
        "delete_team" => {
            let team_id = param(params, "team_id").unwrap_or_default();
            let outcome = manager.teams.lock().await.delete_team(team_id);
            match outcome {
                Ok(message) => ToolResult::success(message),
                Err(e) => ToolResult::error(e),
            }
        }
        "add_agent_to_team" => {
            let agent_id = param(params, "agent_id").unwrap_or_default();
            let team_id = param(params, "team_id").unwrap_or_default();
            if manager.get_agent(agent_id).await.is_none() {
                return ToolResult::error(format!("Agent '{}' not found.", agent_id));
            }
            let outcome = manager.teams.lock().await.add_agent_to_team(agent_id, team_id);
            match outcome {
                Ok(message) => ToolResult::success(message),
                Err(e) => ToolResult::error(e),
            }
        }
        "remove_agent_from_team" => {
            let agent_id = param(params, "agent_id").unwrap_or_default();
            let team_id = param(params, "team_id").unwrap_or_default();
            let outcome = manager
                .teams
                .lock()
                .await
                .remove_agent_from_team(agent_id, team_id);
            match outcome {
                Ok(message) => ToolResult::success(message),
                Err(e) => ToolResult::error(e),
            }
        }
        "list_agents" => {
            let filter_team = param(params, "team_id");
            let directory = manager.directory_snapshot().await;
            let filtered: Vec<serde_json::Value> = directory
                .iter()
                .filter(|e| match filter_team {
                    Some(team) => e.team_id.as_deref() == Some(team),
                    None => true,
                })
                .map(|e| {
                    json!({
                        "agent_id": e.agent_id,
                        "agent_type": e.kind.as_str(),
                        "persona": e.persona,
                        "team_id": e.team_id,
                        "project_name": e.project_name,
                    })
                })
                .collect();
            let mut message = format!("Found {} agent(s)", filtered.len());
            match filter_team {
                Some(team) => message.push_str(&format!(" in team '{}'.", team)),
                None => message.push_str(" in total."),
            }
            ToolResult::success_with(message, json!({ "action": "list_agents", "agents": filtered }))
        }
        "list_teams" => {
            let snapshot = manager.teams.lock().await.team_snapshot();
            ToolResult::success_with(
                format!("Found {} team(s).", snapshot.len()),
                json!({ "action": "list_teams", "teams": snapshot }),
            )
        }
        "get_agent_details" => {
            let agent_id = param(params, "agent_id").unwrap_or_default();
            match manager.get_agent(agent_id).await {
                Some(agent) => {
                    let guard = agent.read().await;
                    let team = manager.teams.lock().await.team_of(agent_id).map(String::from);
                    ToolResult::success_with(
                        format!("Details for '{}'.", agent_id),
                        json!({
                            "agent_id": guard.agent_id,
                            "agent_type": guard.kind.as_str(),
                            "persona": guard.persona,
                            "provider": guard.provider_name,
                            "model": guard.model_id,
                            "state": guard.state,
                            "status": guard.status.as_str(),
                            "team_id": team,
                            "project_name": guard.project_name,
                        }),
                    )
                }
                None => ToolResult::error(format!("Agent '{}' not found.", agent_id)),
            }
        }
        "set_agent_state" => {
            let agent_id = param(params, "agent_id").unwrap_or_default();
            let state = param(params, "state").unwrap_or_default();
            if agent_id == BOOTSTRAP_ADMIN_ID {
                return ToolResult::error("The bootstrap admin's state cannot be set externally.");
            }
            match manager.get_agent(agent_id).await {
                Some(agent) => {
                    let mut guard = agent.write().await;
                    match manager.change_agent_state(&mut guard, state).await {
                        Ok(_) => ToolResult::success(format!(
                            "Agent '{}' state set to '{}'.",
                            agent_id, guard.state
                        )),
                        Err(e) => ToolResult::error(e),
                    }
                }
                None => ToolResult::error(format!("Agent '{}' not found.", agent_id)),
            }
        }
        other => ToolResult::error(format!("Unrecognized manage_team action '{}'.", other)),
    }
}

/// Inject a framework directive into an agent's history.
async fn inject_directive(manager: &Arc<AgentManager>, agent_id: &str, directive: String) {
    if let Some(agent) = manager.get_agent(agent_id).await {
        agent.write().await.message_history.push(Message::framework(
            MessageRole::SystemFrameworkNotification,
            directive.clone(),
        ));
        manager
            .log_interaction(
                agent_id,
                MessageRole::SystemFrameworkNotification,
                &directive,
                None,
                None,
            )
            .await;
    }
}

/// Post-tool workflow interventions, applied only when the turn executed
/// exactly one tool call and it succeeded (tool errors take the corrective
/// branch instead).
pub async fn apply_post_tool_interventions(
    manager: &Arc<AgentManager>,
    agent_id: &str,
    executed: &[ExecutedTool],
) {
    let agent = match manager.get_agent(agent_id).await {
        Some(agent) => agent,
        None => return,
    };
    let (kind, state) = {
        let guard = agent.read().await;
        (guard.kind, guard.state.clone())
    };
    if kind != AgentKind::Pm {
        return;
    }

    // Errors get corrective feedback regardless of call count.
    if let Some(failed) = executed.iter().find(|e| !e.result.is_success()) {
        if state == "activate_workers" {
            inject_directive(
                manager,
                agent_id,
                format!(
                    "[Framework Directive]: The '{}' call failed: {}. Task assignment requires the \
                     exact task UUIDs from project_management.list_tasks — run \
                     <project_management><action>list_tasks</action></project_management> and retry \
                     with a task_uuid from that output.",
                    failed.tool_name, failed.result.message
                ),
            )
            .await;
        }
        return;
    }
    if executed.len() != 1 {
        return;
    }
    let tool = &executed[0];

    match state.as_str() {
        "build_team_tasks" => {
            match (tool.tool_name.as_str(), tool.action()) {
                ("manage_team", Some("create_team")) => {
                    inject_directive(
                        manager,
                        agent_id,
                        "[Framework Directive]: Team created. Next, request the usage details for \
                         creating agents. Output ONLY:\n<tool_information><action>get_info</action>\
                         <tool_name>manage_team</tool_name><sub_action>create_agent</sub_action>\
                         </tool_information>"
                            .to_string(),
                    )
                    .await;
                }
                ("tool_information", Some("get_info")) => {
                    // Only the create_agent usage lookup starts the build
                    // count; other mid-build get_info calls pass through.
                    if tool.args.get("tool_name").map(String::as_str) == Some("manage_team")
                        && tool.args.get("sub_action").map(String::as_str) == Some("create_agent")
                    {
                        agent.write().await.created_agent_count_for_build = 0;
                        inject_directive(
                            manager,
                            agent_id,
                            "[Framework Directive]: You now know how to create agents. Create \
                             worker agent #1 for your team with manage_team.create_agent, giving \
                             it a persona matching your first task."
                                .to_string(),
                        )
                        .await;
                    }
                }
                ("manage_team", Some("create_agent")) => {
                    let (count, target) = {
                        let mut guard = agent.write().await;
                        guard.created_agent_count_for_build += 1;
                        let target = guard
                            .target_worker_agents_for_build
                            .unwrap_or(manager.settings.max_workers_per_pm);
                        (guard.created_agent_count_for_build, target)
                    };
                    if count >= target {
                        inject_directive(
                            manager,
                            agent_id,
                            format!(
                                "[Framework Directive]: Team build complete ({} worker(s) \
                                 created). Output ONLY the following XML: \
                                 <request_state state='pm_activate_workers'/>",
                                count
                            ),
                        )
                        .await;
                    } else {
                        inject_directive(
                            manager,
                            agent_id,
                            format!(
                                "[Framework Directive]: Worker #{} created. Now create worker \
                                 agent #{} with manage_team.create_agent.",
                                count,
                                count + 1
                            ),
                        )
                        .await;
                    }
                }
                _ => {}
            }
        }
        "activate_workers" => match (tool.tool_name.as_str(), tool.action()) {
            ("project_management", Some("list_tasks")) => {
                let unassigned: Vec<TaskSummary> = tool.result.data["tasks"]
                    .as_array()
                    .map(|tasks| {
                        tasks
                            .iter()
                            .filter(|t| t["assignee"].is_null())
                            .filter_map(|t| {
                                Some(TaskSummary {
                                    task_uuid: t["task_uuid"].as_str()?.to_string(),
                                    description: t["description"].as_str()?.to_string(),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let listing = unassigned
                    .iter()
                    .map(|t| format!("- {}: {}", t.task_uuid, t.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                agent.write().await.unassigned_task_summary = Some(unassigned);
                inject_directive(
                    manager,
                    agent_id,
                    format!(
                        "[Framework Directive]: Unassigned tasks:\n{}\nNow list your workers with \
                         <manage_team><action>list_agents</action></manage_team> so you can match \
                         tasks to agents.",
                        listing
                    ),
                )
                .await;
            }
            ("project_management", Some("modify_task")) => {
                let task_uuid = tool.result.data["task_uuid"].as_str().unwrap_or_default();
                let assignee = tool.result.data["assignee"].as_str().map(String::from);
                let description = tool.result.data["description"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();

                let remaining = {
                    let mut guard = agent.write().await;
                    if let Some(summary) = guard.unassigned_task_summary.as_mut() {
                        summary.retain(|t| t.task_uuid != task_uuid);
                    }
                    guard.unassigned_task_summary.clone().unwrap_or_default()
                };

                if let Some(assignee) = assignee {
                    activate_worker_for_task(manager, agent_id, &assignee, task_uuid, &description)
                        .await;
                }

                if remaining.is_empty() {
                    inject_directive(
                        manager,
                        agent_id,
                        format!(
                            "[Framework Directive]: All tasks are assigned. Report to the Admin \
                             now: <send_message><target_agent_id>{}</target_agent_id>\
                             <message_content>Project kickoff complete: all tasks have been \
                             assigned to workers.</message_content></send_message>",
                            BOOTSTRAP_ADMIN_ID
                        ),
                    )
                    .await;
                } else {
                    let listing = remaining
                        .iter()
                        .map(|t| format!("- {}: {}", t.task_uuid, t.description))
                        .collect::<Vec<_>>()
                        .join("\n");
                    inject_directive(
                        manager,
                        agent_id,
                        format!(
                            "[Framework Directive]: Task assigned. Remaining unassigned \
                             tasks:\n{}\nAssign the next one with project_management.modify_task.",
                            listing
                        ),
                    )
                    .await;
                }
            }
            _ => {}
        },
        "manage" => match (tool.tool_name.as_str(), tool.action()) {
            ("project_management", Some("list_tasks")) => {
                inject_directive(
                    manager,
                    agent_id,
                    "[Framework Directive]: Analyze the task list above. If workers are blocked, \
                     message them; if tasks are done, mark them with modify_task; if everything \
                     is complete, report to the Admin that the project is complete."
                        .to_string(),
                )
                .await;
            }
            ("send_message", _) => {
                let to_admin = tool.args.get("target_agent_id").map(String::as_str)
                    == Some(BOOTSTRAP_ADMIN_ID);
                let says_complete = tool
                    .args
                    .get("message_content")
                    .map_or(false, |m| m.contains("is complete"));
                if to_admin && says_complete {
                    inject_directive(
                        manager,
                        agent_id,
                        "[Framework Directive]: Completion reported. Output ONLY the following \
                         XML: <request_state state='pm_standby'/>"
                            .to_string(),
                    )
                    .await;
                }
            }
            _ => {}
        },
        _ => {}
    }
}

/// Hand a newly assigned task to its worker: bind the task description, move
/// the worker into `work`, deliver the assignment message, and schedule it.
async fn activate_worker_for_task(
    manager: &Arc<AgentManager>,
    pm_id: &str,
    worker_id: &str,
    task_uuid: &str,
    description: &str,
) {
    let worker = match manager.get_agent(worker_id).await {
        Some(worker) => worker,
        None => {
            warn!("Task assigned to unknown worker '{}'", worker_id);
            return;
        }
    };
    {
        let mut guard = worker.write().await;
        guard.plan_description = Some(description.to_string());
        if let Err(e) = manager.change_agent_state(&mut guard, "work").await {
            warn!("Could not move worker '{}' to work: {}", worker_id, e);
        }
    }
    route_and_activate_agent_message(
        manager,
        pm_id,
        worker_id,
        &format!("New task assigned (UUID {}): {}", task_uuid, description),
    )
    .await;
    info!("Worker '{}' activated for task {}", worker_id, task_uuid);
}

/// Scan a worker's final response for markdown code blocks whose first line
/// is a filename comment, and auto-save each through the file-system tool.
///
/// Returns the saved file paths.
pub async fn auto_save_worker_files(
    manager: &Arc<AgentManager>,
    agent_id: &str,
    final_text: &str,
) -> Vec<String> {
    let mut saved = Vec::new();
    for caps in CODE_BLOCK_RE.captures_iter(final_text) {
        let block = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let mut lines = block.lines();
        let first = match lines.next() {
            Some(first) => first.trim(),
            None => continue,
        };
        let filepath = match FILE_COMMENT_RE.captures(first) {
            Some(c) => c[1].to_string(),
            None => continue,
        };
        let content: String = lines.collect::<Vec<_>>().join("\n");

        let mut args = HashMap::new();
        args.insert("action".to_string(), "write_file".to_string());
        args.insert("filepath".to_string(), filepath.clone());
        args.insert("content".to_string(), content);
        let executed = execute_single_tool(
            manager,
            agent_id,
            "internal_auto_save",
            "file_system",
            args,
        )
        .await;
        match executed {
            Some(tool) if tool.result.is_success() => {
                manager
                    .send_to_ui(UiEvent::SystemNotification {
                        agent_id: Some(agent_id.to_string()),
                        content: format!("Framework auto-saved file: {}", filepath),
                    })
                    .await;
                info!("Auto-saved '{}' for worker '{}'", filepath, agent_id);
                saved.push(filepath);
            }
            _ => warn!("Auto-save of '{}' failed for '{}'", filepath, agent_id),
        }
    }
    saved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_comment_patterns() {
        for line in [
            "# file: src/main.py",
            "// file: src/index.js",
            "<!-- file: index.html -->",
        ] {
            assert!(FILE_COMMENT_RE.is_match(line), "should match: {}", line);
        }
        assert!(!FILE_COMMENT_RE.is_match("plain first line"));
        let caps = FILE_COMMENT_RE.captures("// file: src/index.js").unwrap();
        assert_eq!(&caps[1], "src/index.js");
    }

    #[test]
    fn test_code_block_extraction() {
        let text = "Done.\n```js\n// file: src/index.js\nconsole.log(1)\n```\n<request_state state='worker_wait'/>";
        let caps: Vec<_> = CODE_BLOCK_RE.captures_iter(text).collect();
        assert_eq!(caps.len(), 1);
        assert!(caps[0][1].starts_with("// file: src/index.js"));
    }
}
