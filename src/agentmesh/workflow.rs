//! Per-kind workflow state machines and prompt selection.
//!
//! Each agent kind has a closed set of legal workflow states; the
//! [`WorkflowManager`] validates every transition, selects the prompt template
//! that drives a cycle from the `(kind, state)` pair, and synthesizes the
//! address-book section of the system prompt from the live agent population.
//!
//! # Address book rules
//!
//! - The admin sees every PM.
//! - A PM sees the admin, its own workers (same project), and peer PMs.
//! - A worker sees the admin, its project's PM, and its team members.

use std::collections::HashMap;

use chrono::Utc;
use log::{info, warn};

use crate::agentmesh::agent::{Agent, AgentKind, BOOTSTRAP_ADMIN_ID};
use crate::agentmesh::config::GovernancePrinciple;
use crate::agentmesh::prompts::{render, PromptLibrary};

/// Lightweight view of one live agent, used to build address books without
/// holding agent locks.
#[derive(Debug, Clone)]
pub struct AgentDirectoryEntry {
    pub agent_id: String,
    pub kind: AgentKind,
    pub persona: String,
    pub project_name: Option<String>,
    pub team_id: Option<String>,
}

/// Context threaded into prompt assembly by the manager.
pub struct PromptInputs<'a> {
    /// Every live agent, including the subject.
    pub population: &'a [AgentDirectoryEntry],
    /// The subject agent's team, if any.
    pub team_id: Option<String>,
    pub project_name: String,
    pub session_name: String,
    pub prompts: &'a PromptLibrary,
    pub principles: &'a [&'a GovernancePrinciple],
}

/// A committed state transition, reported so callers can emit the UI event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub agent_id: String,
    pub old_state: String,
    pub new_state: String,
}

/// Error for a transition request outside the agent kind's legal set.
#[derive(Debug, Clone)]
pub struct InvalidStateError {
    pub agent_id: String,
    pub kind: AgentKind,
    pub requested: String,
    pub allowed: Vec<&'static str>,
}

impl std::fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid state '{}' for {} agent '{}' (allowed: {:?})",
            self.requested, self.kind, self.agent_id, self.allowed
        )
    }
}

impl std::error::Error for InvalidStateError {}

/// FSM rules plus prompt wiring for every agent kind.
pub struct WorkflowManager {
    valid_states: HashMap<AgentKind, Vec<&'static str>>,
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowManager {
    pub fn new() -> Self {
        let mut valid_states = HashMap::new();
        valid_states.insert(
            AgentKind::Admin,
            vec![
                "startup",
                "conversation",
                "planning",
                "work_delegated",
                "work",
                "default",
            ],
        );
        valid_states.insert(
            AgentKind::Pm,
            vec![
                "startup",
                "work",
                "manage",
                "build_team_tasks",
                "activate_workers",
                "standby",
                "default",
            ],
        );
        valid_states.insert(
            AgentKind::Worker,
            vec!["startup", "work", "wait", "default"],
        );
        valid_states.insert(AgentKind::Guardian, vec!["ready"]);

        WorkflowManager { valid_states }
    }

    /// Prompt template key for the state-specific prompt of `(kind, state)`.
    fn state_prompt_key(kind: AgentKind, state: &str) -> &'static str {
        match (kind, state) {
            (AgentKind::Admin, "startup") => "admin_startup_prompt",
            (AgentKind::Admin, "conversation") => "admin_conversation_prompt",
            (AgentKind::Admin, "planning") => "admin_planning_prompt",
            (AgentKind::Admin, "work_delegated") => "admin_delegated_prompt",
            (AgentKind::Admin, "work") => "admin_work_prompt",
            (AgentKind::Pm, "startup") => "pm_startup_prompt",
            (AgentKind::Pm, "work") => "pm_work_prompt",
            (AgentKind::Pm, "manage") => "pm_manage_prompt",
            (AgentKind::Pm, "build_team_tasks") => "pm_build_team_tasks_prompt",
            (AgentKind::Pm, "activate_workers") => "pm_activate_workers_prompt",
            (AgentKind::Pm, "standby") => "pm_standby_prompt",
            (AgentKind::Worker, "startup") => "worker_startup_prompt",
            (AgentKind::Worker, "work") => "worker_work_prompt",
            (AgentKind::Worker, "wait") => "worker_wait_prompt",
            (AgentKind::Guardian, "ready") => "guardian_review_system_prompt",
            _ => "default_system_prompt",
        }
    }

    /// Key of the per-kind standard framework instructions template.
    fn standard_instructions_key(kind: AgentKind) -> Option<&'static str> {
        match kind {
            AgentKind::Admin => Some("admin_standard_framework_instructions"),
            AgentKind::Pm => Some("pm_standard_framework_instructions"),
            AgentKind::Worker => Some("worker_standard_framework_instructions"),
            AgentKind::Guardian => None,
        }
    }

    /// Whether `state` is legal for `kind`.
    pub fn is_valid_state(&self, kind: AgentKind, state: &str) -> bool {
        self.valid_states
            .get(&kind)
            .map_or(false, |states| states.iter().any(|s| *s == state))
    }

    /// Map an LLM-requested state name to the bare state for this kind.
    ///
    /// Agents request states with a kind prefix (`pm_activate_workers`,
    /// `worker_wait`); the stored state is the bare name.
    pub fn normalize_requested_state<'a>(&self, kind: AgentKind, requested: &'a str) -> &'a str {
        let prefix = match kind {
            AgentKind::Admin => "admin_",
            AgentKind::Pm => "pm_",
            AgentKind::Worker => "worker_",
            AgentKind::Guardian => "guardian_",
        };
        requested.strip_prefix(prefix).unwrap_or(requested)
    }

    /// Validate and apply a state change.
    ///
    /// Returns `Ok(Some(transition))` when the state actually changed (the
    /// caller emits the `agent_state_change` UI event), `Ok(None)` when the
    /// agent was already in the requested state (idempotent, except that a
    /// PM re-entering `manage` has its `pm_needs_initial_list_tools` flag
    /// cleared), and `Err` when the state is not legal for the kind.
    pub fn change_state(
        &self,
        agent: &mut Agent,
        requested: &str,
    ) -> Result<Option<StateTransition>, InvalidStateError> {
        let requested = self.normalize_requested_state(agent.kind, requested);
        if !self.is_valid_state(agent.kind, requested) {
            warn!(
                "Invalid state transition for '{}' ({}): '{}'",
                agent.agent_id, agent.kind, requested
            );
            return Err(InvalidStateError {
                agent_id: agent.agent_id.clone(),
                kind: agent.kind,
                requested: requested.to_string(),
                allowed: self.valid_states.get(&agent.kind).cloned().unwrap_or_default(),
            });
        }
        if agent.state == requested {
            if agent.kind == AgentKind::Pm && requested == "manage" {
                agent.pm_needs_initial_list_tools = false;
            }
            return Ok(None);
        }
        let old_state = std::mem::replace(&mut agent.state, requested.to_string());
        if agent.kind == AgentKind::Pm && requested == "manage" {
            agent.pm_needs_initial_list_tools = true;
        }
        info!(
            "Agent '{}' ({}) state '{}' -> '{}'",
            agent.agent_id, agent.kind, old_state, requested
        );
        Ok(Some(StateTransition {
            agent_id: agent.agent_id.clone(),
            old_state,
            new_state: requested.to_string(),
        }))
    }

    fn build_address_book(&self, agent: &Agent, inputs: &PromptInputs<'_>) -> String {
        let mut lines: Vec<String> = Vec::new();
        let my_project = agent
            .project_name
            .clone()
            .unwrap_or_else(|| inputs.project_name.clone());

        match agent.kind {
            AgentKind::Admin => {
                lines.push(format!("- Admin (yourself): {}", agent.agent_id));
                let pms: Vec<&AgentDirectoryEntry> = inputs
                    .population
                    .iter()
                    .filter(|e| e.kind == AgentKind::Pm)
                    .collect();
                if pms.is_empty() {
                    lines.push("- Project Managers: (none active)".to_string());
                } else {
                    lines.push("- Project Managers:".to_string());
                    for pm in pms {
                        lines.push(format!(
                            "  - PM for '{}': {} (Persona: {})",
                            pm.project_name.as_deref().unwrap_or("N/A"),
                            pm.agent_id,
                            pm.persona
                        ));
                    }
                }
            }
            AgentKind::Pm => {
                lines.push(format!(
                    "- Project Manager (yourself): {} for project '{}'",
                    agent.agent_id, my_project
                ));
                lines.push(format!("- Admin: {}", BOOTSTRAP_ADMIN_ID));
                let peers: Vec<&AgentDirectoryEntry> = inputs
                    .population
                    .iter()
                    .filter(|e| e.kind == AgentKind::Pm && e.agent_id != agent.agent_id)
                    .collect();
                if !peers.is_empty() {
                    lines.push("- Other Project Managers:".to_string());
                    for pm in peers {
                        lines.push(format!(
                            "  - PM for '{}': {} (Persona: {})",
                            pm.project_name.as_deref().unwrap_or("N/A"),
                            pm.agent_id,
                            pm.persona
                        ));
                    }
                }
                let workers: Vec<&AgentDirectoryEntry> = inputs
                    .population
                    .iter()
                    .filter(|e| {
                        e.kind == AgentKind::Worker
                            && e.project_name.as_deref() == Some(my_project.as_str())
                    })
                    .collect();
                if workers.is_empty() {
                    lines.push(format!(
                        "- Your worker agents (project '{}'): (none created yet)",
                        my_project
                    ));
                } else {
                    lines.push(format!("- Your worker agents (project '{}'):", my_project));
                    for worker in workers {
                        lines.push(format!(
                            "  - {} (Persona: {}, Team: {})",
                            worker.agent_id,
                            worker.persona,
                            worker.team_id.as_deref().unwrap_or("N/A")
                        ));
                    }
                }
            }
            AgentKind::Worker => {
                lines.push(format!(
                    "- Worker (yourself): {} for project '{}'",
                    agent.agent_id, my_project
                ));
                lines.push(format!("- Admin: {}", BOOTSTRAP_ADMIN_ID));
                let my_pm = inputs.population.iter().find(|e| {
                    e.kind == AgentKind::Pm
                        && e.project_name.as_deref() == Some(my_project.as_str())
                });
                match my_pm {
                    Some(pm) => lines.push(format!(
                        "- Your Project Manager: {} (Persona: {})",
                        pm.agent_id, pm.persona
                    )),
                    None => lines.push("- Your Project Manager: (not identified)".to_string()),
                }
                match &inputs.team_id {
                    Some(team) => {
                        let mates: Vec<&AgentDirectoryEntry> = inputs
                            .population
                            .iter()
                            .filter(|e| {
                                e.team_id.as_deref() == Some(team.as_str())
                                    && e.agent_id != agent.agent_id
                            })
                            .collect();
                        if mates.is_empty() {
                            lines.push(format!(
                                "- Your team members (team {}): (no other members)",
                                team
                            ));
                        } else {
                            lines.push(format!("- Your team members (team {}):", team));
                            for mate in mates {
                                lines.push(format!(
                                    "  - {} (Persona: {}, Type: {})",
                                    mate.agent_id, mate.persona, mate.kind
                                ));
                            }
                        }
                    }
                    None => lines.push("- Your team members: (not assigned to a team)".to_string()),
                }
            }
            AgentKind::Guardian => {
                return "(The guardian reviews output and does not message other agents)"
                    .to_string();
            }
        }

        if lines.is_empty() {
            "(No contacts identified for your role in the current context)".to_string()
        } else {
            lines.join("\n")
        }
    }

    fn format_principles(principles: &[&GovernancePrinciple]) -> String {
        if principles.is_empty() {
            return String::new();
        }
        let mut out = String::from("Governance principles in force:\n");
        for p in principles {
            out.push_str(&format!("- [{}] {}: {}\n", p.id, p.name, p.text));
        }
        out
    }

    /// Assemble the full system prompt for one cycle: the kind's standard
    /// framework instructions (with governance principles and the address
    /// book substituted in) embedded into the state-specific template.
    pub fn get_system_prompt(&self, agent: &Agent, inputs: &PromptInputs<'_>) -> String {
        let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S %Z").to_string();
        let address_book = self.build_address_book(agent, inputs);
        let governance = Self::format_principles(inputs.principles);

        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("agent_id", agent.agent_id.clone());
        ctx.insert("agent_type", agent.kind.as_str().to_string());
        ctx.insert("persona", agent.persona.clone());
        ctx.insert(
            "project_name",
            agent
                .project_name
                .clone()
                .unwrap_or_else(|| inputs.project_name.clone()),
        );
        ctx.insert("session_name", inputs.session_name.clone());
        ctx.insert(
            "team_id",
            inputs.team_id.clone().unwrap_or_else(|| "N/A".to_string()),
        );
        ctx.insert("current_time_utc", now_utc);
        ctx.insert("address_book", address_book);
        ctx.insert("governance_principles", governance);
        ctx.insert(
            "personality_instructions",
            agent
                .config_system_prompt
                .clone()
                .map(|p| p.trim().to_string())
                .unwrap_or_default(),
        );
        ctx.insert(
            "task_description",
            agent
                .plan_description
                .clone()
                .unwrap_or_else(|| "(no task description provided)".to_string()),
        );

        // Standard instructions first: they are themselves a template.
        if let Some(standard_key) = Self::standard_instructions_key(agent.kind) {
            let standard = render(inputs.prompts.get(standard_key), &ctx);
            ctx.insert(standard_key, standard);
        }

        let state_key = Self::state_prompt_key(agent.kind, &agent.state);
        render(inputs.prompts.get(state_key), &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_inputs<'a>(
        population: &'a [AgentDirectoryEntry],
        prompts: &'a PromptLibrary,
    ) -> PromptInputs<'a> {
        PromptInputs {
            population,
            team_id: None,
            project_name: "demo".to_string(),
            session_name: "session-1".to_string(),
            prompts,
            principles: &[],
        }
    }

    #[test]
    fn test_change_state_validates_kind() {
        let wf = WorkflowManager::new();
        let mut worker = Agent::new("w1", AgentKind::Worker, "Coder", "p", "m");
        assert!(wf.change_state(&mut worker, "manage").is_err());
        let transition = wf.change_state(&mut worker, "work").unwrap().unwrap();
        assert_eq!(transition.old_state, "startup");
        assert_eq!(worker.state, "work");
    }

    #[test]
    fn test_change_state_idempotent() {
        let wf = WorkflowManager::new();
        let mut worker = Agent::new("w1", AgentKind::Worker, "Coder", "p", "m");
        wf.change_state(&mut worker, "work").unwrap();
        let repeat = wf.change_state(&mut worker, "work").unwrap();
        assert!(repeat.is_none());
    }

    #[test]
    fn test_pm_manage_sets_list_tools_flag() {
        let wf = WorkflowManager::new();
        let mut pm = Agent::new("pm1", AgentKind::Pm, "PM", "p", "m");
        wf.change_state(&mut pm, "manage").unwrap();
        assert!(pm.pm_needs_initial_list_tools);
        // Re-entering the same state clears the flag.
        wf.change_state(&mut pm, "manage").unwrap();
        assert!(!pm.pm_needs_initial_list_tools);
    }

    #[test]
    fn test_prefixed_request_normalized() {
        let wf = WorkflowManager::new();
        let mut pm = Agent::new("pm1", AgentKind::Pm, "PM", "p", "m");
        wf.change_state(&mut pm, "pm_activate_workers").unwrap();
        assert_eq!(pm.state, "activate_workers");
        let mut worker = Agent::new("w1", AgentKind::Worker, "W", "p", "m");
        wf.change_state(&mut worker, "worker_wait").unwrap();
        assert_eq!(worker.state, "wait");
    }

    #[test]
    fn test_address_book_role_rules() {
        let wf = WorkflowManager::new();
        let prompts = PromptLibrary::new(Default::default());
        let population = vec![
            AgentDirectoryEntry {
                agent_id: BOOTSTRAP_ADMIN_ID.to_string(),
                kind: AgentKind::Admin,
                persona: "Admin".to_string(),
                project_name: None,
                team_id: None,
            },
            AgentDirectoryEntry {
                agent_id: "pm_demo".to_string(),
                kind: AgentKind::Pm,
                persona: "Manager".to_string(),
                project_name: Some("demo".to_string()),
                team_id: Some("t1".to_string()),
            },
            AgentDirectoryEntry {
                agent_id: "worker_a".to_string(),
                kind: AgentKind::Worker,
                persona: "Coder".to_string(),
                project_name: Some("demo".to_string()),
                team_id: Some("t1".to_string()),
            },
            AgentDirectoryEntry {
                agent_id: "worker_other".to_string(),
                kind: AgentKind::Worker,
                persona: "Other".to_string(),
                project_name: Some("unrelated".to_string()),
                team_id: Some("t9".to_string()),
            },
        ];

        let admin = Agent::new(BOOTSTRAP_ADMIN_ID, AgentKind::Admin, "Admin", "p", "m");
        let inputs = empty_inputs(&population, &prompts);
        let book = wf.build_address_book(&admin, &inputs);
        assert!(book.contains("pm_demo"));
        assert!(!book.contains("worker_a"));

        let mut pm = Agent::new("pm_demo", AgentKind::Pm, "Manager", "p", "m");
        pm.project_name = Some("demo".to_string());
        let book = wf.build_address_book(&pm, &inputs);
        assert!(book.contains(BOOTSTRAP_ADMIN_ID));
        assert!(book.contains("worker_a"));
        assert!(!book.contains("worker_other"));

        let mut worker = Agent::new("worker_a", AgentKind::Worker, "Coder", "p", "m");
        worker.project_name = Some("demo".to_string());
        let mut inputs = empty_inputs(&population, &prompts);
        inputs.team_id = Some("t1".to_string());
        let book = wf.build_address_book(&worker, &inputs);
        assert!(book.contains(BOOTSTRAP_ADMIN_ID));
        assert!(book.contains("pm_demo"));
        assert!(!book.contains("worker_other"));
    }

    #[test]
    fn test_system_prompt_contains_standard_instructions() {
        let wf = WorkflowManager::new();
        let prompts = PromptLibrary::new(Default::default());
        let population: Vec<AgentDirectoryEntry> = Vec::new();
        let mut pm = Agent::new("pm_demo", AgentKind::Pm, "Manager", "p", "m");
        pm.state = "manage".to_string();
        let inputs = empty_inputs(&population, &prompts);
        let prompt = wf.get_system_prompt(&pm, &inputs);
        assert!(prompt.contains("Framework Instructions (Project Manager)"));
        assert!(prompt.contains("pm_demo"));
        assert!(prompt.contains("project_management.list_tasks"));
    }
}
