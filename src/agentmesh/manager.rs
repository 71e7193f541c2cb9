//! The agent manager: registry, scheduling, lifecycle, and periodic timers.
//!
//! [`AgentManager`] is the process-wide owner of every subsystem (key
//! manager, performance tracker, model registry, workflow manager, tool
//! executor, team state, session manager, health monitor, interaction log)
//! and of the agent registry itself. Agents are stored as
//! `Arc<RwLock<Agent>>`; the scheduler guarantees at most one in-flight
//! cycle per agent, and cycle tasks never hold the registry lock across a
//! suspension point.
//!
//! There are no back-pointers from agents to the manager: cycle and
//! interaction code receives the manager as an explicit `Arc` parameter.
//!
//! # Typical wiring
//!
//! ```rust,no_run
//! use agentmesh::config::Settings;
//! use agentmesh::manager::AgentManager;
//! use std::path::Path;
//!
//! # async {
//! let manager = AgentManager::new(Settings::default(), Path::new("data")).unwrap();
//! manager.bootstrap("ollama-local-11434", "llama3").await;
//! manager.spawn_periodic_tasks();
//! manager.handle_user_message("Build me a snake game").await;
//! # };
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::agentmesh::agent::{
    Agent, AgentKind, AgentStatus, Message, MessageRole, BOOTSTRAP_ADMIN_ID, GUARDIAN_AGENT_ID,
};
use crate::agentmesh::config::Settings;
use crate::agentmesh::cycle;
use crate::agentmesh::event::{UiEvent, UiSink};
use crate::agentmesh::failover::FailoverHandler;
use crate::agentmesh::guardian::{self, ReviewOutcome};
use crate::agentmesh::health::{self, HealthMonitor};
use crate::agentmesh::interaction_log::{InteractionLog, KnowledgeStore};
use crate::agentmesh::key_manager::KeyManager;
use crate::agentmesh::model_registry::ModelRegistry;
use crate::agentmesh::performance::PerformanceTracker;
use crate::agentmesh::prompts::{render, PromptLibrary};
use crate::agentmesh::provider::ProviderAdapter;
use crate::agentmesh::session::{DynamicAgentConfig, SessionManager, SessionSnapshot};
use crate::agentmesh::state::TeamState;
use crate::agentmesh::summarizer;
use crate::agentmesh::tool_protocol::ToolExecutor;
use crate::agentmesh::tools::{
    FileSystemTool, KnowledgeBaseTool, ManageTeamTool, ProjectManagementTool, SendMessageTool,
};
use crate::agentmesh::workflow::{AgentDirectoryEntry, PromptInputs, WorkflowManager};

/// Window within which repeated malformed-call feedback is suppressed per
/// (agent, error signature).
const MALFORMED_FEEDBACK_WINDOW: Duration = Duration::from_secs(300);

/// Period of the contaminated-history sweep.
const CONTAMINATED_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Process-wide orchestration hub. Construct once, share as `Arc`.
pub struct AgentManager {
    pub settings: Settings,
    pub prompts: PromptLibrary,
    pub workflow: WorkflowManager,
    pub key_manager: Arc<KeyManager>,
    pub tracker: Arc<PerformanceTracker>,
    pub registry: Arc<ModelRegistry>,
    pub failover: FailoverHandler,
    pub tool_executor: Arc<ToolExecutor>,
    pub project_tool: Arc<ProjectManagementTool>,
    pub knowledge: Arc<KnowledgeStore>,
    pub interaction_log: Arc<InteractionLog>,
    pub health: HealthMonitor,
    pub teams: Mutex<TeamState>,
    session: Mutex<SessionManager>,
    providers: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    agents: RwLock<HashMap<String, Arc<RwLock<Agent>>>>,
    ui_sinks: RwLock<Vec<Arc<dyn UiSink>>>,
    active_cycles: Mutex<HashSet<String>>,
    malformed_feedback: Mutex<HashMap<String, Instant>>,
    dynamic_configs: Mutex<Vec<DynamicAgentConfig>>,
    /// Weak self-reference so `&self` methods can hand an `Arc` to spawned
    /// tasks. Set once at construction.
    weak_self: std::sync::RwLock<std::sync::Weak<AgentManager>>,
}

impl AgentManager {
    /// Build the manager and every subsystem under `data_dir`.
    pub fn new(settings: Settings, data_dir: &Path) -> io::Result<Arc<Self>> {
        let key_manager = Arc::new(KeyManager::new(
            settings.provider_api_keys.clone(),
            data_dir.join("quarantine_state.json"),
        ));
        let tracker = Arc::new(PerformanceTracker::new(
            data_dir.join("model_performance_metrics.json"),
        ));
        let registry = Arc::new(ModelRegistry::new(
            settings.model_tier,
            settings.local_api_scan_ports.clone(),
            settings.local_api_scan_enabled,
            settings.local_api_scan_timeout,
        ));
        let failover = FailoverHandler::new(
            Arc::clone(&key_manager),
            Arc::clone(&tracker),
            Arc::clone(&registry),
        );
        let knowledge = Arc::new(KnowledgeStore::open(data_dir.join("knowledge.jsonl"))?);
        let interaction_log = Arc::new(InteractionLog::open(data_dir.join("interactions.jsonl"))?);

        let project_tool = Arc::new(ProjectManagementTool::new());
        let mut executor = ToolExecutor::new();
        executor.register(Arc::new(FileSystemTool));
        executor.register(Arc::new(ManageTeamTool));
        executor.register(Arc::new(SendMessageTool));
        executor.register(Arc::clone(&project_tool) as Arc<dyn crate::agentmesh::tool_protocol::Tool>);
        executor.register(Arc::new(KnowledgeBaseTool::new(Arc::clone(&knowledge))));

        let prompts = PromptLibrary::new(settings.prompts.clone());
        let session = SessionManager::new(data_dir.join("sessions"));

        info!("AgentManager initialized (data dir: {})", data_dir.display());
        let manager = Arc::new(AgentManager {
            settings,
            prompts,
            workflow: WorkflowManager::new(),
            key_manager,
            tracker,
            registry,
            failover,
            tool_executor: Arc::new(executor),
            project_tool,
            knowledge,
            interaction_log,
            health: HealthMonitor::new(),
            teams: Mutex::new(TeamState::new()),
            session: Mutex::new(session),
            providers: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            ui_sinks: RwLock::new(Vec::new()),
            active_cycles: Mutex::new(HashSet::new()),
            malformed_feedback: Mutex::new(HashMap::new()),
            dynamic_configs: Mutex::new(Vec::new()),
            weak_self: std::sync::RwLock::new(std::sync::Weak::new()),
        });
        if let Ok(mut weak) = manager.weak_self.write() {
            *weak = Arc::downgrade(&manager);
        }
        Ok(manager)
    }

    fn strong_self(&self) -> Option<Arc<AgentManager>> {
        self.weak_self.read().ok().and_then(|weak| weak.upgrade())
    }

    // ── Providers and UI ─────────────────────────────────────────────────

    pub async fn register_provider(&self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.provider_name().to_string();
        self.providers.write().await.insert(name.clone(), adapter);
        info!("Provider '{}' registered", name);
    }

    pub async fn provider(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.read().await.get(name).cloned()
    }

    pub async fn providers_snapshot(&self) -> HashMap<String, Arc<dyn ProviderAdapter>> {
        self.providers.read().await.clone()
    }

    pub async fn add_ui_sink(&self, sink: Arc<dyn UiSink>) {
        self.ui_sinks.write().await.push(sink);
    }

    /// Broadcast to every sink, pruning the ones that report disconnection.
    pub async fn send_to_ui(&self, event: UiEvent) {
        let sinks = self.ui_sinks.read().await.clone();
        if sinks.is_empty() {
            return;
        }
        let mut disconnected = Vec::new();
        for (idx, sink) in sinks.iter().enumerate() {
            if !sink.send(&event).await {
                disconnected.push(idx);
            }
        }
        if !disconnected.is_empty() {
            let mut sinks = self.ui_sinks.write().await;
            let mut idx = 0usize;
            sinks.retain(|_| {
                let keep = !disconnected.contains(&idx);
                idx += 1;
                keep
            });
            debug!("Pruned {} disconnected UI sink(s)", disconnected.len());
        }
    }

    // ── Registry access ──────────────────────────────────────────────────

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<RwLock<Agent>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    async fn insert_agent(&self, agent: Agent) -> Arc<RwLock<Agent>> {
        let agent_id = agent.agent_id.clone();
        let arc = Arc::new(RwLock::new(agent));
        self.agents.write().await.insert(agent_id, Arc::clone(&arc));
        arc
    }

    /// Lock-light view of the population for address books and listings.
    pub async fn directory_snapshot(&self) -> Vec<AgentDirectoryEntry> {
        let arcs: Vec<Arc<RwLock<Agent>>> = self.agents.read().await.values().cloned().collect();
        let mut raw = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            raw.push((
                guard.agent_id.clone(),
                guard.kind,
                guard.persona.clone(),
                guard.project_name.clone(),
            ));
        }
        let teams = self.teams.lock().await;
        raw.into_iter()
            .map(|(agent_id, kind, persona, project_name)| {
                let team_id = teams.team_of(&agent_id).map(String::from);
                AgentDirectoryEntry {
                    agent_id,
                    kind,
                    persona,
                    project_name,
                    team_id,
                }
            })
            .collect()
    }

    // ── Prompt assembly ──────────────────────────────────────────────────

    /// Assemble the full system prompt for the agent's current state.
    pub async fn build_system_prompt_for(&self, agent_id: &str) -> String {
        let population = self.directory_snapshot().await;
        let (project, session) = self.active_context().await;
        let team_id = self.teams.lock().await.team_of(agent_id).map(String::from);

        let agent_arc = match self.get_agent(agent_id).await {
            Some(arc) => arc,
            None => return self.prompts.get("default_system_prompt").to_string(),
        };
        let guard = agent_arc.read().await;
        let principles = self.settings.principles_for(guard.kind.as_str());
        let inputs = PromptInputs {
            population: &population,
            team_id,
            project_name: guard
                .project_name
                .clone()
                .or(project)
                .unwrap_or_else(|| "N/A".to_string()),
            session_name: session.unwrap_or_else(|| "N/A".to_string()),
            prompts: &self.prompts,
            principles: &principles,
        };
        self.workflow.get_system_prompt(&guard, &inputs)
    }

    // ── Session context and persistence ──────────────────────────────────

    pub async fn active_context(&self) -> (Option<String>, Option<String>) {
        let session = self.session.lock().await;
        (
            session.current_project().map(String::from),
            session.current_session().map(String::from),
        )
    }

    pub async fn log_interaction(
        &self,
        agent_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls_json: Option<serde_json::Value>,
        tool_results_json: Option<serde_json::Value>,
    ) {
        let session_id = {
            let session = self.session.lock().await;
            session
                .current_session()
                .map(String::from)
                .unwrap_or_else(|| "no-session".to_string())
        };
        if let Err(e) = self
            .interaction_log
            .log_interaction(&session_id, agent_id, role, content, tool_calls_json, tool_results_json)
            .await
        {
            error!("Interaction log write failed: {}", e);
        }
    }

    /// Persist the session snapshot (teams, assignments, dynamic agents,
    /// histories of dynamically created agents).
    pub async fn save_session(&self) {
        let (teams, agent_to_team) = {
            let teams = self.teams.lock().await;
            (teams.team_snapshot(), teams.agent_map_snapshot())
        };
        let dynamic_agents_config = self.dynamic_configs.lock().await.clone();
        let mut agent_histories = HashMap::new();
        for config in &dynamic_agents_config {
            if let Some(arc) = self.get_agent(&config.agent_id).await {
                agent_histories
                    .insert(config.agent_id.clone(), arc.read().await.message_history.clone());
            }
        }
        let snapshot = SessionSnapshot {
            teams,
            agent_to_team,
            dynamic_agents_config,
            agent_histories,
        };
        let session = self.session.lock().await;
        if let Err(e) = session.save_snapshot(&snapshot) {
            error!("Session snapshot save failed: {}", e);
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Start a cycle task for `agent_id`, enforcing at most one in-flight
    /// cycle per agent. Returns whether a cycle was actually scheduled.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// and [`cycle::run_cycle`] call each other; leaving both as opaque
    /// `impl Future` types creates a recursive type the compiler cannot
    /// prove `Send` for. Boxing one side of the cycle breaks that recursion
    /// without changing behavior.
    pub fn schedule_cycle<'a>(
        &'a self,
        agent_id: &'a str,
        retry_count: u32,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let agent_arc = match self.get_agent(agent_id).await {
                Some(arc) => arc,
                None => {
                    warn!("schedule_cycle for unknown agent '{}'", agent_id);
                    return false;
                }
            };
            {
                let guard = agent_arc.read().await;
                if guard.status.is_paused() {
                    debug!(
                        "Not scheduling '{}': paused status {}",
                        agent_id, guard.status
                    );
                    return false;
                }
                if guard.awaiting_project_approval {
                    debug!("Not scheduling '{}': awaiting project approval", agent_id);
                    return false;
                }
            }
            let manager = match self.strong_self() {
                Some(manager) => manager,
                None => return false,
            };
            {
                let mut active = self.active_cycles.lock().await;
                if !active.insert(agent_id.to_string()) {
                    debug!("Cycle already in flight for '{}'", agent_id);
                    return false;
                }
            }
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                let mut retry = retry_count;
                // A cycle may hand back a reschedule request (reactivation,
                // retry, failover switch, critical intervention). Looping here
                // keeps the in-flight marker owned by one task at a time.
                loop {
                    let next =
                        cycle::run_cycle(Arc::clone(&manager), agent_id.clone(), retry).await;
                    match next {
                        Some(next_retry) => retry = next_retry,
                        None => break,
                    }
                }
                manager.finish_cycle(&agent_id).await;
            });
            true
        })
    }

    /// Clear the in-flight marker for `agent_id`.
    pub async fn finish_cycle(&self, agent_id: &str) {
        self.active_cycles.lock().await.remove(agent_id);
    }

    /// Whether a cycle is currently in flight for `agent_id`.
    pub async fn cycle_in_flight(&self, agent_id: &str) -> bool {
        self.active_cycles.lock().await.contains(agent_id)
    }

    // ── User entry point ─────────────────────────────────────────────────

    /// Accept one user message: ensure an active session, append to the
    /// admin's history, and schedule the admin if it is idle (otherwise the
    /// message stays queued in history).
    pub async fn handle_user_message(&self, text: &str) {
        {
            let mut session = self.session.lock().await;
            session.ensure_active();
        }
        let admin = match self.get_agent(BOOTSTRAP_ADMIN_ID).await {
            Some(admin) => admin,
            None => {
                error!("No bootstrap admin registered; dropping user message");
                return;
            }
        };
        let status = {
            let mut guard = admin.write().await;
            guard.message_history.push(Message::user(text.to_string()));
            guard.status
        };
        self.log_interaction(BOOTSTRAP_ADMIN_ID, MessageRole::User, text, None, None)
            .await;

        if status == AgentStatus::Idle {
            self.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await;
        } else {
            self.send_to_ui(UiEvent::AgentStatusUpdate {
                agent_id: BOOTSTRAP_ADMIN_ID.to_string(),
                status: status.as_str().to_string(),
                detail: Some("User message queued.".to_string()),
            })
            .await;
        }
    }

    // ── Agent lifecycle ──────────────────────────────────────────────────

    /// Create the bootstrap admin and guardian bound to the given provider
    /// and model.
    pub async fn bootstrap(&self, provider: &str, model: &str) {
        let sandbox_root = self.settings.projects_base_dir.clone();
        let admin = Agent::new(BOOTSTRAP_ADMIN_ID, AgentKind::Admin, "Admin", provider, model)
            .with_sandbox(sandbox_root.join(BOOTSTRAP_ADMIN_ID));
        let guardian = Agent::new(
            GUARDIAN_AGENT_ID,
            AgentKind::Guardian,
            "Guardian",
            provider,
            model,
        )
        .with_temperature(0.1)
        .with_sandbox(sandbox_root.join(GUARDIAN_AGENT_ID));
        self.insert_agent(admin).await;
        self.insert_agent(guardian).await;
        info!("Bootstrap agents created (admin + guardian on {}/{})", provider, model);
    }

    /// Dynamically create a worker agent. Provider/model default to the
    /// creator's binding (or the admin's when there is no creator).
    pub async fn create_agent_instance(
        &self,
        persona: &str,
        provider: Option<&str>,
        model: Option<&str>,
        system_prompt: Option<&str>,
        temperature: Option<f32>,
        team_id: Option<&str>,
        creator_id: Option<&str>,
    ) -> Result<String, String> {
        let template = match creator_id {
            Some(creator) => self.get_agent(creator).await,
            None => self.get_agent(BOOTSTRAP_ADMIN_ID).await,
        };
        let (default_provider, default_model, project_name) = match template {
            Some(arc) => {
                let guard = arc.read().await;
                (
                    guard.provider_name.clone(),
                    guard.model_id.clone(),
                    guard.project_name.clone(),
                )
            }
            None => return Err("No template agent available for defaults.".to_string()),
        };

        let slug: String = persona
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        let agent_id = format!("worker_{}_{}", slug, &uuid::Uuid::new_v4().to_string()[..8]);

        let mut agent = Agent::new(
            agent_id.clone(),
            AgentKind::Worker,
            persona,
            provider.unwrap_or(&default_provider),
            model.unwrap_or(&default_model),
        )
        .with_sandbox(self.settings.projects_base_dir.join(&agent_id));
        if let Some(temperature) = temperature {
            agent.temperature = temperature;
        }
        if let Some(system_prompt) = system_prompt {
            agent.config_system_prompt = Some(system_prompt.to_string());
        }
        agent.project_name = project_name.clone();

        let config = DynamicAgentConfig {
            agent_id: agent_id.clone(),
            kind: AgentKind::Worker,
            persona: persona.to_string(),
            provider_name: agent.provider_name.clone(),
            model_id: agent.model_id.clone(),
            temperature: agent.temperature,
            system_prompt: system_prompt.map(String::from),
            project_name,
        };

        self.insert_agent(agent).await;
        self.dynamic_configs.lock().await.push(config);

        if let Some(team_id) = team_id {
            let outcome = self.teams.lock().await.add_agent_to_team(&agent_id, team_id);
            if let Err(e) = outcome {
                warn!("Could not add '{}' to team '{}': {}", agent_id, team_id, e);
            }
        }

        self.send_to_ui(UiEvent::SystemNotification {
            agent_id: Some(agent_id.clone()),
            content: format!("Agent '{}' created (persona '{}').", agent_id, persona),
        })
        .await;
        info!("Dynamic agent '{}' created", agent_id);
        self.save_session().await;
        Ok(agent_id)
    }

    /// Delete a non-bootstrap agent, removing it from teams, health records
    /// and the dynamic-config list.
    pub async fn delete_agent_instance(&self, agent_id: &str) -> Result<String, String> {
        let agent = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| format!("Agent '{}' not found.", agent_id))?;
        if agent.read().await.is_bootstrap() {
            return Err(format!("Agent '{}' is a bootstrap agent and cannot be deleted.", agent_id));
        }
        self.agents.write().await.remove(agent_id);
        self.teams.lock().await.remove_agent_everywhere(agent_id);
        self.health.forget_agent(agent_id).await;
        self.dynamic_configs
            .lock()
            .await
            .retain(|c| c.agent_id != agent_id);
        self.send_to_ui(UiEvent::SystemNotification {
            agent_id: Some(agent_id.to_string()),
            content: format!("Agent '{}' deleted.", agent_id),
        })
        .await;
        info!("Agent '{}' deleted", agent_id);
        Ok(format!("Agent '{}' deleted.", agent_id))
    }

    // ── Projects ─────────────────────────────────────────────────────────

    /// Create a project with its PM agent. The PM is seeded with the plan
    /// and an initial "Project Plan" task, and stays unscheduled until the
    /// user approves the project.
    pub async fn create_project_and_pm_agent(
        &self,
        title: &str,
        plan: &str,
    ) -> Result<String, String> {
        if title.trim().is_empty() {
            return Err("Project title cannot be empty.".to_string());
        }
        let project_name = title.trim().to_string();
        let slug: String = project_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        let pm_id = format!("pm_{}", slug);
        if self.get_agent(&pm_id).await.is_some() {
            return Err(format!("A PM for project '{}' already exists.", project_name));
        }

        let (provider, model) = match self.get_agent(BOOTSTRAP_ADMIN_ID).await {
            Some(admin) => {
                let guard = admin.read().await;
                (guard.provider_name.clone(), guard.model_id.clone())
            }
            None => return Err("No admin agent to inherit a provider from.".to_string()),
        };

        let mut pm = Agent::new(
            pm_id.clone(),
            AgentKind::Pm,
            format!("PM for {}", project_name),
            provider.clone(),
            model.clone(),
        )
        .with_project(project_name.clone())
        .with_sandbox(self.settings.projects_base_dir.join(&slug));
        pm.plan_description = Some(plan.to_string());
        pm.awaiting_project_approval = true;
        let temperature = pm.temperature;
        self.insert_agent(pm).await;
        self.dynamic_configs.lock().await.push(DynamicAgentConfig {
            agent_id: pm_id.clone(),
            kind: AgentKind::Pm,
            persona: format!("PM for {}", project_name),
            provider_name: provider,
            model_id: model,
            temperature,
            system_prompt: None,
            project_name: Some(project_name.clone()),
        });

        {
            let mut session = self.session.lock().await;
            session.set_project(project_name.clone());
            session.ensure_active();
        }
        self.project_tool
            .seed_task(&project_name, &format!("Project Plan: {}", plan))
            .await;

        let mut preview = plan.to_string();
        if preview.len() > 200 {
            let mut end = 200;
            while !preview.is_char_boundary(end) {
                end -= 1;
            }
            preview.truncate(end);
        }
        self.send_to_ui(UiEvent::ProjectPendingApproval {
            project_name: project_name.clone(),
            pm_agent_id: pm_id.clone(),
            plan_preview: preview,
        })
        .await;
        info!("Project '{}' created; PM '{}' awaiting approval", project_name, pm_id);
        Ok(pm_id)
    }

    /// User approval for a pending project: unblock the PM and give it its
    /// first cycle.
    pub async fn approve_project(&self, pm_agent_id: &str) -> Result<(), String> {
        let agent = self
            .get_agent(pm_agent_id)
            .await
            .ok_or_else(|| format!("Agent '{}' not found.", pm_agent_id))?;
        let project_name = {
            let mut guard = agent.write().await;
            if !guard.awaiting_project_approval {
                return Err(format!("Agent '{}' is not awaiting approval.", pm_agent_id));
            }
            guard.awaiting_project_approval = false;
            guard.project_name.clone().unwrap_or_default()
        };
        self.send_to_ui(UiEvent::ProjectApproved {
            project_name,
            pm_agent_id: pm_agent_id.to_string(),
        })
        .await;
        self.save_session().await;
        self.schedule_cycle(pm_agent_id, 0).await;
        Ok(())
    }

    /// Resolve a pending guardian concern: the user either approves the
    /// withheld text (it joins the history as the assistant message) or
    /// overrides it (the agent is told its response was withheld). Either
    /// way the agent returns to idle.
    pub async fn resolve_cg_concern(&self, agent_id: &str, approve: bool) -> Result<(), String> {
        let agent = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| format!("Agent '{}' not found.", agent_id))?;
        let released = {
            let mut guard = agent.write().await;
            if guard.status != AgentStatus::AwaitingUserReviewCg {
                return Err(format!(
                    "Agent '{}' is not awaiting concern review.",
                    agent_id
                ));
            }
            let concern = guard
                .cg_concern
                .take()
                .ok_or_else(|| format!("Agent '{}' has no stored concern.", agent_id))?;
            if approve {
                guard
                    .message_history
                    .push(Message::assistant(concern.original_text.clone()));
            } else {
                guard.message_history.push(Message::framework(
                    MessageRole::SystemIntervention,
                    format!(
                        "[Framework Notice]: Your previous response was withheld after review: {}",
                        concern.concern_details
                    ),
                ));
            }
            guard.status = AgentStatus::Idle;
            concern
        };
        if approve {
            self.log_interaction(agent_id, MessageRole::Assistant, &released.original_text, None, None)
                .await;
        }
        self.send_to_ui(UiEvent::SystemNotification {
            agent_id: Some(agent_id.to_string()),
            content: format!(
                "Guardian concern {} for '{}'.",
                if approve { "overridden by user" } else { "upheld" },
                agent_id
            ),
        })
        .await;
        Ok(())
    }

    // ── Workflow state ───────────────────────────────────────────────────

    /// Validate and apply a state change, emitting the UI event on an
    /// actual transition. Returns whether the state changed.
    pub async fn change_agent_state(
        &self,
        agent: &mut Agent,
        requested: &str,
    ) -> Result<bool, String> {
        match self.workflow.change_state(agent, requested) {
            Ok(Some(transition)) => {
                self.send_to_ui(UiEvent::AgentStateChange {
                    agent_id: transition.agent_id.clone(),
                    old_state: transition.old_state.clone(),
                    new_state: transition.new_state.clone(),
                    message: format!(
                        "Agent '{}' state changed from '{}' to '{}'.",
                        transition.agent_id, transition.old_state, transition.new_state
                    ),
                })
                .await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    // ── Guardian services ────────────────────────────────────────────────

    fn guardian_system_prompt(&self, template_key: &str) -> String {
        let principles = self.settings.governance_principles.iter().filter(|p| p.enabled);
        let mut principles_text = String::new();
        for p in principles {
            principles_text.push_str(&format!("- [{}] {}: {}\n", p.id, p.name, p.text));
        }
        let mut ctx = HashMap::new();
        ctx.insert("governance_principles", principles_text);
        render(self.prompts.get(template_key), &ctx)
    }

    async fn guardian_binding(
        &self,
    ) -> Option<(Arc<dyn ProviderAdapter>, String, Option<String>)> {
        let guardian = self.get_agent(GUARDIAN_AGENT_ID).await?;
        let (provider_name, model) = {
            let guard = guardian.read().await;
            (guard.provider_name.clone(), guard.model_id.clone())
        };
        let adapter = self.provider(&provider_name).await?;
        let api_key = if adapter.is_local() {
            None
        } else {
            self.key_manager
                .get_active_key_config(&provider_name)
                .await
                .map(|k| k.api_key)
        };
        Some((adapter, model, api_key))
    }

    /// Guardian verdict on a final response. Fail-open when the guardian is
    /// missing or unreachable.
    pub async fn guardian_review(&self, text: &str) -> ReviewOutcome {
        let (adapter, model, api_key) = match self.guardian_binding().await {
            Some(binding) => binding,
            None => {
                warn!("Guardian unavailable; failing open");
                return ReviewOutcome::Approved;
            }
        };
        let system_prompt = self.guardian_system_prompt("guardian_review_system_prompt");
        guardian::review_final_response(adapter.as_ref(), &model, api_key, system_prompt, text)
            .await
    }

    /// Guardian-backed context summarization for one agent's history.
    pub async fn summarize_agent_history(
        &self,
        agent_id: &str,
        history: &[Message],
    ) -> Option<Vec<Message>> {
        let (adapter, model, api_key) = self.guardian_binding().await?;
        let system_prompt = self.guardian_system_prompt("guardian_summarize_system_prompt");
        summarizer::summarize_history(
            adapter.as_ref(),
            &model,
            api_key,
            &system_prompt,
            agent_id,
            history,
        )
        .await
    }

    // ── Malformed-feedback rate limiting ─────────────────────────────────

    /// Whether corrective feedback for this (agent, error signature) may be
    /// sent now; records the send time when allowed.
    pub async fn should_send_malformed_feedback(&self, agent_id: &str, signature: &str) -> bool {
        let key = format!("{}:{}", agent_id, signature);
        let mut feedback = self.malformed_feedback.lock().await;
        let now = Instant::now();
        match feedback.get(&key) {
            Some(last) if now.duration_since(*last) < MALFORMED_FEEDBACK_WINDOW => false,
            _ => {
                feedback.insert(key, now);
                true
            }
        }
    }

    // ── Contaminated-history cleanup ─────────────────────────────────────

    /// Sweep every agent history and the interaction log for messages
    /// matching known contamination patterns. `role=tool` content is exempt
    /// on both sides.
    pub async fn run_contaminated_cleanup(&self) {
        let mut messages_removed = 0usize;
        for agent_id in self.agent_ids().await {
            if let Some(arc) = self.get_agent(&agent_id).await {
                let mut guard = arc.write().await;
                messages_removed += health::clean_contaminated_history(&mut guard.message_history);
            }
        }

        let mut contaminated_ids = HashSet::new();
        for record in self.interaction_log.all_records().await {
            if record.role == MessageRole::Tool {
                continue;
            }
            let probe = Message::framework(record.role, record.content.clone());
            if health::is_contaminated(&probe) {
                contaminated_ids.insert(record.id);
            }
        }
        let records_removed = match self.interaction_log.delete_where_ids(&contaminated_ids).await {
            Ok(removed) => removed,
            Err(e) => {
                error!("Interaction-log cleanup failed: {}", e);
                0
            }
        };

        if messages_removed > 0 || records_removed > 0 {
            info!(
                "Contaminated cleanup: {} message(s), {} record(s) removed",
                messages_removed, records_removed
            );
            self.send_to_ui(UiEvent::AutomaticContaminatedCleanup {
                messages_removed,
                records_removed,
            })
            .await;
        }
    }

    // ── Periodic timers ──────────────────────────────────────────────────

    /// Spawn the PM manage sweep and the contaminated-history sweep.
    pub fn spawn_periodic_tasks(&self) {
        let manager = match self.strong_self() {
            Some(manager) => manager,
            None => return,
        };
        let sweep = Arc::clone(&manager);
        tokio::spawn(async move {
            let interval = Duration::from_secs_f64(
                sweep.settings.pm_manage_check_interval_seconds.max(1.0),
            );
            loop {
                tokio::time::sleep(interval).await;
                sweep.run_pm_manage_sweep().await;
            }
        });

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CONTAMINATED_SWEEP_INTERVAL).await;
                manager.run_contaminated_cleanup().await;
            }
        });
    }

    /// One pass of the periodic PM check: idle PMs sitting in a passive
    /// state are pushed into (or re-activated in) `manage`, unless they are
    /// still awaiting project approval.
    pub async fn run_pm_manage_sweep(&self) {
        for agent_id in self.agent_ids().await {
            let arc = match self.get_agent(&agent_id).await {
                Some(arc) => arc,
                None => continue,
            };
            let (kind, status, state, awaiting) = {
                let guard = arc.read().await;
                (
                    guard.kind,
                    guard.status,
                    guard.state.clone(),
                    guard.awaiting_project_approval,
                )
            };
            if kind != AgentKind::Pm || status != AgentStatus::Idle || awaiting {
                continue;
            }
            match state.as_str() {
                "conversation" => {
                    // Legacy state name from older configs; normalize into
                    // manage and run a check cycle.
                    let mut guard = arc.write().await;
                    if self.change_agent_state(&mut guard, "manage").await.is_ok() {
                        drop(guard);
                        self.schedule_cycle(&agent_id, 0).await;
                    }
                }
                "manage" => {
                    self.schedule_cycle(&agent_id, 0).await;
                }
                _ => {}
            }
        }
    }
}
