//! The per-agent execution cycle.
//!
//! [`run_cycle`] drives one reasoning turn of one agent: prompt assembly via
//! the workflow manager, a summarization check, the streaming LLM call, the
//! event-interpretation loop, tool dispatch through the interaction handler,
//! outcome classification, and finally next-step scheduling (reactivation,
//! retry, or failover).
//!
//! A turn may restart internally when a priority recheck was flagged by an
//! inbound message; the number of internal turns is bounded by
//! `max_cycle_turns`, past which the agent is parked in error status.
//!
//! Errors never escape this function: they are materialized as history
//! messages, UI events, and outcome flags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::RwLock;

use crate::agentmesh::agent::{
    Agent, AgentKind, AgentStatus, CgConcern, Message, MessageRole, ToolCallRecord,
};
use crate::agentmesh::event::UiEvent;
use crate::agentmesh::guardian::ReviewOutcome;
use crate::agentmesh::interaction;
use crate::agentmesh::manager::AgentManager;
use crate::agentmesh::provider::{
    CompletionRequest, ProviderError, ProviderErrorKind, StreamEvent,
};
use crate::agentmesh::summarizer;
use crate::agentmesh::xml_parser;

/// PM `manage` cycles that produce thought but no action before the agent is
/// forced to standby.
const PM_MANAGE_UNPRODUCTIVE_LIMIT: u32 = 3;

/// Tool executions between periodic stat reports.
const TOOL_STATS_REPORT_EVERY: u64 = 10;

/// Classification of one finished cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub cycle_completed_successfully: bool,
    pub executed_tool_successfully_this_cycle: bool,
    pub thought_produced_this_cycle: bool,
    pub state_change_requested_this_cycle: bool,
    pub is_provider_level_error: bool,
    pub is_key_related_error: bool,
    pub trigger_failover: bool,
    pub needs_reactivation_after_cycle: bool,
    pub last_error: Option<ProviderError>,
    /// Last assistant-visible text this cycle, fed to the health monitor.
    pub last_content: String,
}

impl CycleOutcome {
    fn record_provider_error(&mut self, error: ProviderError) {
        match error.kind {
            ProviderErrorKind::Transient => {
                self.needs_reactivation_after_cycle = true;
            }
            ProviderErrorKind::KeyRelated => {
                self.is_key_related_error = true;
                self.is_provider_level_error = true;
                self.trigger_failover = true;
            }
            ProviderErrorKind::ProviderDown | ProviderErrorKind::ModelUnusable => {
                self.is_provider_level_error = true;
                self.trigger_failover = true;
            }
        }
        self.last_error = Some(error);
        self.cycle_completed_successfully = false;
    }

    fn took_meaningful_action(&self) -> bool {
        self.executed_tool_successfully_this_cycle || self.state_change_requested_this_cycle
    }
}

/// Run one cycle for `agent_id`. Scheduled via
/// [`AgentManager::schedule_cycle`](crate::agentmesh::manager::AgentManager::schedule_cycle),
/// which enforces the one-in-flight-cycle-per-agent invariant: the scheduler
/// clears the in-flight marker when this returns, and a `Some(retry_count)`
/// return value asks it to schedule the same agent again.
pub async fn run_cycle(
    manager: Arc<AgentManager>,
    agent_id: String,
    retry_count: u32,
) -> Option<u32> {
    let agent_arc = match manager.get_agent(&agent_id).await {
        Some(agent) => agent,
        None => {
            warn!("run_cycle for unknown agent '{}'", agent_id);
            return None;
        }
    };
    debug!("Cycle started for '{}' (retry {})", agent_id, retry_count);

    let started = Instant::now();
    let mut outcome = CycleOutcome::default();
    let mut turn_count: u32 = 0;
    let (mut provider_name, mut model_id) = {
        let guard = agent_arc.read().await;
        (guard.provider_name.clone(), guard.model_id.clone())
    };

    'turns: loop {
        turn_count += 1;
        if turn_count > manager.settings.max_cycle_turns {
            let message = format!(
                "Agent '{}' exceeded the maximum of {} turns in a single cycle. Forcing error \
                 status to prevent an infinite loop.",
                agent_id, manager.settings.max_cycle_turns
            );
            error!("{}", message);
            let mut guard = agent_arc.write().await;
            guard.status = AgentStatus::Error;
            guard
                .message_history
                .push(Message::framework(MessageRole::SystemError, message.clone()));
            drop(guard);
            manager
                .send_to_ui(UiEvent::Error {
                    agent_id: Some(agent_id.clone()),
                    content: message,
                })
                .await;
            outcome.cycle_completed_successfully = false;
            outcome.needs_reactivation_after_cycle = false;
            break 'turns;
        }

        // Prompt assembly.
        let system_prompt = manager.build_system_prompt_for(&agent_id).await;
        {
            let mut guard = agent_arc.write().await;
            guard.set_system_prompt(system_prompt);
            guard.needs_priority_recheck = false;
            // A PM freshly arrived in `manage` starts with the mandatory
            // task listing.
            if guard.kind == AgentKind::Pm
                && guard.state == "manage"
                && guard.pm_needs_initial_list_tools
            {
                guard.pm_needs_initial_list_tools = false;
                let directive = "[Framework Directive]: Begin your management pass by listing \
                                 the project tasks. Output ONLY:\n<project_management>\
                                 <action>list_tasks</action></project_management>"
                    .to_string();
                guard.message_history.push(Message::framework(
                    MessageRole::SystemFrameworkNotification,
                    directive,
                ));
            }
        }

        // Context-size check.
        let (history, temperature, kind, state) = {
            let guard = agent_arc.read().await;
            provider_name = guard.provider_name.clone();
            model_id = guard.model_id.clone();
            (
                guard.message_history.clone(),
                guard.temperature,
                guard.kind,
                guard.state.clone(),
            )
        };
        let max_tokens = manager.settings.default_model_max_tokens;
        let estimate = summarizer::estimate_token_count(&history);
        if summarizer::should_summarize(estimate, max_tokens) {
            info!(
                "Token estimate {} over threshold for '{}'; summarizing",
                estimate, agent_id
            );
            if let Some(condensed) = manager.summarize_agent_history(&agent_id, &history).await {
                let condensed_len = condensed.len();
                agent_arc.write().await.message_history = condensed;
                manager
                    .send_to_ui(UiEvent::ContextSummarization {
                        agent_id: agent_id.clone(),
                        original_messages: history.len(),
                        condensed_messages: condensed_len,
                    })
                    .await;
            }
        }

        // Into processing.
        agent_arc.write().await.status = AgentStatus::Processing;
        manager
            .send_to_ui(UiEvent::AgentStatusUpdate {
                agent_id: agent_id.clone(),
                status: AgentStatus::Processing.as_str().to_string(),
                detail: None,
            })
            .await;

        let adapter = match manager.provider(&provider_name).await {
            Some(adapter) => adapter,
            None => {
                let error = ProviderError::provider_down(format!(
                    "Provider '{}' is not registered",
                    provider_name
                ));
                record_error_message(&manager, &agent_arc, &agent_id, &error).await;
                outcome.record_provider_error(error);
                break 'turns;
            }
        };

        let api_key = if adapter.is_local() {
            None
        } else {
            match manager.key_manager.get_active_key_config(&provider_name).await {
                Some(active) => {
                    agent_arc.write().await.current_api_key = Some(active.api_key.clone());
                    Some(active.api_key)
                }
                None => {
                    let error = ProviderError::key_related(format!(
                        "All keys for provider '{}' are quarantined or none are configured",
                        provider_name
                    ));
                    record_error_message(&manager, &agent_arc, &agent_id, &error).await;
                    outcome.record_provider_error(error);
                    break 'turns;
                }
            }
        };

        let request = CompletionRequest {
            model: model_id.clone(),
            messages: agent_arc.read().await.message_history.clone(),
            temperature,
            max_tokens: None,
            api_key,
        };

        let mut stream = match adapter.stream_completion(request).await {
            Ok(stream) => stream,
            Err(error) => {
                record_error_message(&manager, &agent_arc, &agent_id, &error).await;
                outcome.record_provider_error(error);
                break 'turns;
            }
        };

        let mut text_buffer = String::new();
        let mut action_taken = false;
        let mut turn_failed = false;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::ResponseChunk { content } => {
                    text_buffer.push_str(&content);
                }

                StreamEvent::AgentThought { content } => {
                    outcome.thought_produced_this_cycle = true;
                    manager
                        .log_interaction(
                            &agent_id,
                            MessageRole::SystemFrameworkNotification,
                            &format!("[Thought]: {}", content),
                            None,
                            None,
                        )
                        .await;
                    if content.len() > 80 {
                        let (_, session) = manager.active_context().await;
                        if let Err(e) = manager
                            .knowledge
                            .save_knowledge(session.as_deref(), None, &content, None, 0.6)
                            .await
                        {
                            warn!("Could not save thought to knowledge store: {}", e);
                        }
                    }
                }

                StreamEvent::Error { error } => {
                    record_error_message(&manager, &agent_arc, &agent_id, &error).await;
                    outcome.record_provider_error(error);
                    turn_failed = true;
                    break;
                }

                StreamEvent::WorkflowExecuted { result } => {
                    info!(
                        "Workflow '{}' executed for '{}'",
                        result.workflow_name, agent_id
                    );
                    if let (Some(title), Some(plan)) =
                        (result.project_title.clone(), result.plan_description.clone())
                    {
                        if let Err(e) = manager.create_project_and_pm_agent(&title, &plan).await {
                            warn!("Project creation from workflow failed: {}", e);
                        }
                    }
                    if let Some(next_state) = &result.next_state {
                        let mut guard = agent_arc.write().await;
                        if let Err(e) = manager.change_agent_state(&mut guard, next_state).await {
                            warn!("Workflow state change rejected: {}", e);
                        }
                    }
                    if let Some(ui_message) = &result.ui_message {
                        manager
                            .send_to_ui(UiEvent::SystemNotification {
                                agent_id: Some(agent_id.clone()),
                                content: ui_message.clone(),
                            })
                            .await;
                    }
                    for other in &result.agents_to_schedule {
                        if other != &agent_id {
                            manager.schedule_cycle(other, 0).await;
                        }
                    }
                    outcome.cycle_completed_successfully = true;
                    outcome.needs_reactivation_after_cycle = result
                        .agents_to_schedule
                        .iter()
                        .any(|other| other == &agent_id);
                    action_taken = true;
                    break;
                }

                StreamEvent::MalformedToolCall {
                    tool_name,
                    error_message,
                    raw_text,
                } => {
                    let schemas = manager.tool_executor.schemas();
                    let names: Vec<&str> = schemas.iter().map(|s| s.name).collect();
                    let recovery = xml_parser::recover_xml(&raw_text, &names);
                    let recovered = if recovery.was_modified {
                        let parsed =
                            xml_parser::find_and_parse_xml_tool_calls(&recovery.recovered_xml, &schemas);
                        if !parsed.valid_calls.is_empty() {
                            manager
                                .send_to_ui(UiEvent::XmlRecoverySuccess {
                                    agent_id: agent_id.clone(),
                                    recovered_calls: parsed.valid_calls.len(),
                                    applied_fixes: recovery.applied_fixes.clone(),
                                })
                                .await;
                            info!(
                                "Recovered {} malformed tool call(s) for '{}' ({:?})",
                                parsed.valid_calls.len(),
                                agent_id,
                                recovery.applied_fixes
                            );
                            let calls: Vec<ToolCallRecord> = parsed
                                .valid_calls
                                .iter()
                                .map(|c| ToolCallRecord {
                                    id: format!("recovered_{}", uuid::Uuid::new_v4()),
                                    name: c.tool_name.clone(),
                                    arguments: serde_json::to_value(&c.args)
                                        .unwrap_or(serde_json::Value::Null),
                                })
                                .collect();
                            execute_tool_requests(
                                &manager,
                                &agent_arc,
                                &agent_id,
                                calls,
                                recovery.recovered_xml.clone(),
                                &mut outcome,
                            )
                            .await;
                            action_taken = true;
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    };

                    if !recovered {
                        let mut signature_tail = error_message.clone();
                        signature_tail.truncate(50);
                        let signature = format!("malformed_{}_{}", tool_name, signature_tail);
                        if manager.should_send_malformed_feedback(&agent_id, &signature).await {
                            let usage = manager
                                .tool_executor
                                .detailed_usage(&tool_name)
                                .unwrap_or_default();
                            let feedback = format!(
                                "[Framework Feedback]: Your XML for tool '{}' was malformed: {}\n\
                                 Correct usage:\n{}",
                                tool_name, error_message, usage
                            );
                            agent_arc
                                .write()
                                .await
                                .message_history
                                .push(Message::framework(MessageRole::SystemError, feedback.clone()));
                            manager
                                .log_interaction(&agent_id, MessageRole::SystemError, &feedback, None, None)
                                .await;
                        } else {
                            debug!(
                                "Suppressed repeated malformed-call feedback for '{}' ({})",
                                agent_id, signature
                            );
                        }
                        outcome.needs_reactivation_after_cycle = true;
                        outcome.cycle_completed_successfully = false;
                        action_taken = true;
                    }
                    break;
                }

                StreamEvent::AgentStateChangeRequested { state } => {
                    let change = {
                        let mut guard = agent_arc.write().await;
                        manager.change_agent_state(&mut guard, &state).await
                    };
                    match change {
                        Ok(_) => {
                            outcome.state_change_requested_this_cycle = true;
                            let now_activating = {
                                let guard = agent_arc.read().await;
                                guard.kind == AgentKind::Pm && guard.state == "activate_workers"
                            };
                            if now_activating {
                                let directive = "[Framework Directive]: You are now activating \
                                                 workers. Start by listing the project tasks. \
                                                 Output ONLY:\n<project_management><action>\
                                                 list_tasks</action></project_management>"
                                    .to_string();
                                agent_arc.write().await.message_history.push(Message::framework(
                                    MessageRole::SystemFrameworkNotification,
                                    directive,
                                ));
                            }
                        }
                        Err(e) => {
                            let feedback = format!(
                                "[Framework Feedback]: State change to '{}' rejected: {}",
                                state, e
                            );
                            agent_arc
                                .write()
                                .await
                                .message_history
                                .push(Message::framework(MessageRole::SystemError, feedback));
                        }
                    }
                    outcome.needs_reactivation_after_cycle = true;
                    action_taken = true;
                    break;
                }

                StreamEvent::ToolRequests { calls, raw_text } => {
                    execute_tool_requests(
                        &manager,
                        &agent_arc,
                        &agent_id,
                        calls,
                        raw_text.clone(),
                        &mut outcome,
                    )
                    .await;
                    // A state change embedded alongside the tool calls is
                    // honored after the tools ran.
                    if let Some(state) = xml_parser::find_request_state(&raw_text) {
                        let parked = agent_arc.read().await.status == AgentStatus::Error;
                        if !parked {
                            let mut guard = agent_arc.write().await;
                            if manager.change_agent_state(&mut guard, &state).await.is_ok() {
                                outcome.state_change_requested_this_cycle = true;
                            }
                        }
                    }
                    action_taken = true;
                    break;
                }

                StreamEvent::FinalResponse { content } => {
                    finalize_final_response(&manager, &agent_arc, &agent_id, content, &mut outcome)
                        .await;
                    action_taken = true;
                    break;
                }

                StreamEvent::PmStartupMissingTaskList => {
                    let feedback = "[Framework Feedback]: Your startup response must contain a \
                                    <task_list> block with one <task> entry per work item. \
                                    Think again and output the task list."
                        .to_string();
                    agent_arc
                        .write()
                        .await
                        .message_history
                        .push(Message::framework(MessageRole::SystemError, feedback));
                    outcome.needs_reactivation_after_cycle = true;
                    outcome.cycle_completed_successfully = false;
                    action_taken = true;
                    break;
                }

                StreamEvent::PmCompletionDetection { content } => {
                    debug!("Completion-flavored output from '{}': {}", agent_id, content);
                    let directive = "[Framework Directive]: Before declaring completion, verify \
                                     it: list the tasks with project_management.list_tasks and \
                                     confirm every task is done. If they are, report to the Admin \
                                     followed by requesting standby state: \
                                     <request_state state='pm_standby'/>"
                        .to_string();
                    agent_arc.write().await.message_history.push(Message::framework(
                        MessageRole::SystemFrameworkNotification,
                        directive,
                    ));
                    outcome.needs_reactivation_after_cycle = true;
                    action_taken = true;
                    break;
                }
            }
        }

        // Text-buffer fallback: residual text with no classified action is a
        // final response (guardian review included).
        if !action_taken && !turn_failed {
            if !text_buffer.trim().is_empty() {
                finalize_final_response(
                    &manager,
                    &agent_arc,
                    &agent_id,
                    text_buffer.clone(),
                    &mut outcome,
                )
                .await;
            } else if kind == AgentKind::Pm && state == "manage" {
                let unproductive = {
                    let mut guard = agent_arc.write().await;
                    guard.manage_unproductive_cycles += 1;
                    guard.manage_unproductive_cycles
                };
                if unproductive >= PM_MANAGE_UNPRODUCTIVE_LIMIT {
                    info!(
                        "PM '{}' unproductive in manage for {} cycles; forcing standby",
                        agent_id, unproductive
                    );
                    let mut guard = agent_arc.write().await;
                    guard.manage_unproductive_cycles = 0;
                    let _ = manager.change_agent_state(&mut guard, "standby").await;
                    guard.message_history.push(Message::framework(
                        MessageRole::SystemIntervention,
                        "[Framework Notice]: No productive output while managing; the framework \
                         has moved you to standby."
                            .to_string(),
                    ));
                }
            }
        }
        if outcome.last_content.is_empty() && !text_buffer.trim().is_empty() {
            outcome.last_content = text_buffer.clone();
        }

        // Priority recheck: a message arrived mid-cycle, restart the turn.
        let recheck = agent_arc.read().await.needs_priority_recheck;
        if recheck {
            debug!("Priority recheck for '{}'; restarting turn", agent_id);
            continue 'turns;
        }
        break 'turns;
    }

    // ── Post-loop bookkeeping ────────────────────────────────────────────

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let success = outcome.last_error.is_none()
        && (outcome.cycle_completed_successfully || outcome.took_meaningful_action());
    manager
        .tracker
        .record_call(&provider_name, &model_id, duration_ms, success)
        .await;

    if success {
        agent_arc.write().await.failover.reset();
    }

    // Health recording and possible intervention.
    {
        let (state, content) = {
            let guard = agent_arc.read().await;
            (guard.state.clone(), outcome.last_content.clone())
        };
        manager
            .health
            .record_agent_cycle(
                &agent_id,
                &content,
                outcome.took_meaningful_action(),
                outcome.thought_produced_this_cycle,
                &state,
            )
            .await;
        let plan = {
            let guard = agent_arc.read().await;
            manager.health.analyze_agent_health(&guard).await
        };
        if let Some(plan) = plan {
            let schedule_now = {
                let mut guard = agent_arc.write().await;
                manager.health.apply_intervention(&mut guard, &plan).await
            };
            manager
                .send_to_ui(UiEvent::SystemNotification {
                    agent_id: Some(agent_id.clone()),
                    content: format!("Health intervention applied: {}", plan.kind.as_str()),
                })
                .await;
            if schedule_now {
                report_tool_stats(&manager).await;
                return Some(0);
            }
        }
    }

    // Next-step scheduling.
    if outcome.trigger_failover {
        let error = outcome
            .last_error
            .clone()
            .unwrap_or_else(|| ProviderError::provider_down("unclassified cycle failure"));
        let providers = manager.providers_snapshot().await;
        let decision = {
            let mut guard = agent_arc.write().await;
            manager
                .failover
                .handle_cycle_failure(&mut guard, &error, &providers)
                .await
        };
        match decision {
            crate::agentmesh::failover::FailoverDecision::SwitchModel { provider, model_id } => {
                manager
                    .send_to_ui(UiEvent::SystemNotification {
                        agent_id: Some(agent_id.clone()),
                        content: format!("Failover: switched to {}/{}", provider, model_id),
                    })
                    .await;
                agent_arc.write().await.status = AgentStatus::Idle;
                report_tool_stats(&manager).await;
                return Some(0);
            }
            crate::agentmesh::failover::FailoverDecision::Exhausted { reason } => {
                let mut guard = agent_arc.write().await;
                guard.status = AgentStatus::Error;
                guard
                    .message_history
                    .push(Message::framework(MessageRole::SystemError, reason.clone()));
                drop(guard);
                manager
                    .send_to_ui(UiEvent::Error {
                        agent_id: Some(agent_id.clone()),
                        content: reason,
                    })
                    .await;
                report_tool_stats(&manager).await;
                return None;
            }
        }
    }

    let (status, paused) = {
        let guard = agent_arc.read().await;
        (guard.status, guard.status.is_paused())
    };

    let reschedule = if outcome.needs_reactivation_after_cycle
        && !paused
        && status != AgentStatus::Error
    {
        if outcome.took_meaningful_action() {
            agent_arc.write().await.status = AgentStatus::Idle;
            Some(0)
        } else {
            let next_retry = retry_count + 1;
            if next_retry > manager.settings.max_stream_retries {
                let message = format!(
                    "Agent '{}' exhausted {} cycle retries without progress.",
                    agent_id, manager.settings.max_stream_retries
                );
                warn!("{}", message);
                let mut guard = agent_arc.write().await;
                guard.status = AgentStatus::Error;
                guard
                    .message_history
                    .push(Message::framework(MessageRole::SystemError, message.clone()));
                drop(guard);
                manager
                    .send_to_ui(UiEvent::Error {
                        agent_id: Some(agent_id.clone()),
                        content: message,
                    })
                    .await;
                None
            } else {
                // The in-flight marker stays held through the backoff, so no
                // competing cycle can slip in before the retry.
                tokio::time::sleep(Duration::from_secs_f64(
                    manager.settings.retry_delay_seconds,
                ))
                .await;
                agent_arc.write().await.status = AgentStatus::Idle;
                Some(next_retry)
            }
        }
    } else {
        {
            let mut guard = agent_arc.write().await;
            if guard.status == AgentStatus::Processing || guard.status == AgentStatus::ExecutingTool
            {
                guard.status = AgentStatus::Idle;
            }
        }
        let status = agent_arc.read().await.status;
        manager
            .send_to_ui(UiEvent::AgentStatusUpdate {
                agent_id: agent_id.clone(),
                status: status.as_str().to_string(),
                detail: None,
            })
            .await;
        None
    };

    report_tool_stats(&manager).await;
    debug!(
        "Cycle finished for '{}' in {:.0}ms (success={})",
        agent_id, duration_ms, success
    );
    reschedule
}

async fn record_error_message(
    manager: &Arc<AgentManager>,
    agent_arc: &Arc<RwLock<Agent>>,
    agent_id: &str,
    error: &ProviderError,
) {
    let message = format!("[Framework Error]: {}", error);
    agent_arc
        .write()
        .await
        .message_history
        .push(Message::framework(MessageRole::SystemError, message.clone()));
    manager
        .log_interaction(agent_id, MessageRole::SystemError, &message, None, None)
        .await;
    manager
        .send_to_ui(UiEvent::Error {
            agent_id: Some(agent_id.to_string()),
            content: error.to_string(),
        })
        .await;
}

/// Append the assistant tool-call message, run every call through the
/// interaction handler, then apply the post-tool interventions.
async fn execute_tool_requests(
    manager: &Arc<AgentManager>,
    agent_arc: &Arc<RwLock<Agent>>,
    agent_id: &str,
    calls: Vec<ToolCallRecord>,
    raw_text: String,
    outcome: &mut CycleOutcome,
) {
    let assistant_content = if raw_text.trim().is_empty() {
        None
    } else {
        Some(raw_text)
    };
    agent_arc.write().await.message_history.push(Message::assistant_with_tools(
        assistant_content.clone(),
        calls.clone(),
    ));
    manager
        .log_interaction(
            agent_id,
            MessageRole::Assistant,
            assistant_content.as_deref().unwrap_or(""),
            serde_json::to_value(&calls).ok(),
            None,
        )
        .await;

    let mut executed = Vec::new();
    for call in calls {
        let args: HashMap<String, String> = call
            .arguments
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(tool) =
            interaction::execute_single_tool(manager, agent_id, &call.id, &call.name, args).await
        {
            executed.push(tool);
        }
        // A tool may have parked the agent (3-strike guard); stop dispatching.
        if agent_arc.read().await.status == AgentStatus::Error {
            break;
        }
    }

    let any_success = executed.iter().any(|t| t.result.is_success());
    if any_success {
        outcome.executed_tool_successfully_this_cycle = true;
        manager.health.reset_counters(agent_id).await;
    }
    outcome.needs_reactivation_after_cycle = true;

    interaction::apply_post_tool_interventions(manager, agent_id, &executed).await;
}

/// Final-response handling: worker auto-save, guardian review, embedded
/// state-change processing, persistence and UI forwarding.
async fn finalize_final_response(
    manager: &Arc<AgentManager>,
    agent_arc: &Arc<RwLock<Agent>>,
    agent_id: &str,
    content: String,
    outcome: &mut CycleOutcome,
) {
    outcome.last_content = content.clone();
    let kind = agent_arc.read().await.kind;

    if kind == AgentKind::Worker && content.contains("<request_state state='worker_wait'/>") {
        interaction::auto_save_worker_files(manager, agent_id, &content).await;
    }

    let review = if kind == AgentKind::Guardian {
        ReviewOutcome::Approved
    } else {
        manager.guardian_review(&content).await
    };

    match review {
        ReviewOutcome::Approved => {
            agent_arc
                .write()
                .await
                .message_history
                .push(Message::assistant(content.clone()));
            manager
                .log_interaction(agent_id, MessageRole::Assistant, &content, None, None)
                .await;
            manager
                .send_to_ui(UiEvent::SystemNotification {
                    agent_id: Some(agent_id.to_string()),
                    content: content.clone(),
                })
                .await;
            if let Some(state) = xml_parser::find_request_state(&content) {
                let mut guard = agent_arc.write().await;
                if manager.change_agent_state(&mut guard, &state).await.is_ok() {
                    outcome.state_change_requested_this_cycle = true;
                }
            }
            outcome.cycle_completed_successfully = true;
        }
        ReviewOutcome::Concern { details } => {
            {
                let mut guard = agent_arc.write().await;
                guard.cg_concern = Some(CgConcern {
                    original_text: content.clone(),
                    concern_details: details.clone(),
                });
                guard.status = AgentStatus::AwaitingUserReviewCg;
            }
            manager
                .send_to_ui(UiEvent::CgConcern {
                    agent_id: agent_id.to_string(),
                    original_text: content,
                    concern_details: details,
                })
                .await;
            outcome.cycle_completed_successfully = true;
            outcome.needs_reactivation_after_cycle = false;
        }
    }
}

async fn report_tool_stats(manager: &Arc<AgentManager>) {
    let total = manager.tool_executor.total_executions().await;
    if total > 0 && total % TOOL_STATS_REPORT_EVERY == 0 {
        manager.tool_executor.report_stats().await;
    }
}
