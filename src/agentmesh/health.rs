//! Agent health supervision.
//!
//! After every cycle the monitor records what the agent produced and updates
//! a per-agent [`HealthRecord`]: consecutive empty, identical and minimal
//! response counters, a rolling window of response hashes, and how long the
//! agent has sat in its current workflow state. Crossing a threshold yields
//! an [`InterventionPlan`]: a typed guidance message, optional context
//! clearing, counter/status resets, and whether a fresh cycle should be
//! scheduled immediately.
//!
//! Bootstrap agents (the admin and the guardian) are observed but never
//! intervened on.
//!
//! The monitor also owns the contaminated-history matcher used by the
//! periodic sweep: messages matching known failure patterns are removed from
//! agent histories (and the corresponding rows from the interaction log),
//! always exempting `role=tool` messages whose content is not interpretable.

use std::collections::HashMap;
use std::time::Instant;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::agentmesh::agent::{Agent, AgentKind, AgentStatus, Message, MessageRole};

/// Consecutive empty responses before a blocking intervention.
pub const EMPTY_RESPONSE_THRESHOLD: u32 = 2;
/// Consecutive identical responses before a blocking intervention.
pub const IDENTICAL_RESPONSE_THRESHOLD: u32 = 2;
/// Consecutive minimal responses before an intervention.
pub const MINIMAL_RESPONSE_THRESHOLD: u32 = 3;
/// Cycles in one workflow state before the stuck-state intervention.
pub const STUCK_STATE_THRESHOLD: u32 = 6;

/// Rolling window of response hashes consulted by the identical check.
const HASH_WINDOW: usize = 3;

/// Messages kept (beyond the system prompt) when an intervention clears
/// problematic context.
const CONTEXT_KEEP_RECENT: usize = 4;

lazy_static! {
    static ref THINK_BLOCK_RE: Regex = Regex::new(r"(?is)<think>.*?</think>").unwrap();
    static ref CONTAMINATION_PATTERNS: Vec<Regex> = vec![
        Regex::new(
            r"(?is)<tool_information><action>execute</action><tool_name>.*?</tool_name>.*?</tool_information>"
        )
        .unwrap(),
        Regex::new(r"(?i)Invalid or missing 'action'\. Must be 'list_tools' or 'get_info'").unwrap(),
        Regex::new(r"(?is)Tool Execution Failed.*?Invalid or missing 'action'").unwrap(),
    ];
}

/// Detected violation kinds, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    EmptyResponseViolation,
    IdenticalResponseViolation,
    MinimalResponsePattern,
    StuckStatePattern,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::EmptyResponseViolation => "empty_response_violation",
            ViolationKind::IdenticalResponseViolation => "identical_response_violation",
            ViolationKind::MinimalResponsePattern => "minimal_response_pattern",
            ViolationKind::StuckStatePattern => "stuck_state_pattern",
        }
    }

    /// Critical violations block the agent and get an immediate reschedule.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ViolationKind::EmptyResponseViolation | ViolationKind::IdenticalResponseViolation
        )
    }
}

/// What the monitor wants done about a violation.
#[derive(Debug, Clone)]
pub struct InterventionPlan {
    pub agent_id: String,
    pub kind: ViolationKind,
    /// `role=system` guidance injected into the agent's history.
    pub guidance: String,
    /// Clear problematic context, keeping the system prompt and the last few
    /// messages.
    pub clear_context: bool,
    /// Schedule a cycle right away (critical violations only).
    pub schedule_immediately: bool,
}

/// Rolling per-agent health metrics.
#[derive(Debug)]
pub struct HealthRecord {
    pub consecutive_empty_responses: u32,
    pub consecutive_identical_responses: u32,
    pub consecutive_minimal_responses: u32,
    pub cycles_in_current_state: u32,
    current_state: String,
    recent_hashes: Vec<String>,
    last_meaningful_action: Instant,
    pub interventions: Vec<&'static str>,
}

impl HealthRecord {
    fn new() -> Self {
        HealthRecord {
            consecutive_empty_responses: 0,
            consecutive_identical_responses: 0,
            consecutive_minimal_responses: 0,
            cycles_in_current_state: 0,
            current_state: String::new(),
            recent_hashes: Vec::new(),
            last_meaningful_action: Instant::now(),
            interventions: Vec::new(),
        }
    }

    fn hash_of(content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn is_minimal(content: &str, has_action: bool, has_thought: bool) -> bool {
        if has_action {
            return false;
        }
        let cleaned = THINK_BLOCK_RE.replace_all(content, "");
        let cleaned = cleaned.trim();
        has_thought && cleaned.len() < 50
    }

    fn is_identical(&self, content: &str) -> bool {
        let hash = Self::hash_of(content);
        self.recent_hashes
            .iter()
            .rev()
            .take(HASH_WINDOW)
            .any(|h| *h == hash)
    }

    /// Record one cycle's output. Any meaningful action (tool success or
    /// state change) zeroes every pattern counter.
    pub fn record_response(
        &mut self,
        content: &str,
        has_action: bool,
        has_thought: bool,
        current_state: &str,
    ) {
        if self.current_state != current_state {
            self.current_state = current_state.to_string();
            self.cycles_in_current_state = 0;
        }
        self.cycles_in_current_state += 1;

        if has_action {
            self.consecutive_empty_responses = 0;
            self.consecutive_identical_responses = 0;
            self.consecutive_minimal_responses = 0;
            self.last_meaningful_action = Instant::now();
        } else {
            let is_empty = content.trim().is_empty();
            let is_identical = !is_empty && self.is_identical(content);
            let is_minimal = Self::is_minimal(content, has_action, has_thought);
            if is_empty {
                self.consecutive_empty_responses += 1;
                self.consecutive_identical_responses = 0;
                self.consecutive_minimal_responses = 0;
            } else if is_identical {
                self.consecutive_identical_responses += 1;
                self.consecutive_empty_responses = 0;
                self.consecutive_minimal_responses = 0;
            } else if is_minimal {
                self.consecutive_minimal_responses += 1;
                self.consecutive_empty_responses = 0;
                self.consecutive_identical_responses = 0;
            } else {
                self.consecutive_empty_responses = 0;
                self.consecutive_identical_responses = 0;
                self.consecutive_minimal_responses = 0;
                self.last_meaningful_action = Instant::now();
            }
        }

        if !content.trim().is_empty() {
            self.recent_hashes.push(Self::hash_of(content));
            if self.recent_hashes.len() > 10 {
                self.recent_hashes.remove(0);
            }
        }
    }

    pub fn is_stuck_in_state(&self, max_cycles: u32) -> bool {
        self.cycles_in_current_state >= max_cycles
    }

    pub fn seconds_since_meaningful_action(&self) -> f64 {
        self.last_meaningful_action.elapsed().as_secs_f64()
    }

    /// Weighted 1.0 → 0.0 health score.
    pub fn health_score(&self) -> f64 {
        let mut score = 1.0f64;
        if self.consecutive_empty_responses > 0 {
            score -= (self.consecutive_empty_responses as f64 * 0.15).min(0.4);
        }
        if self.consecutive_identical_responses > 0 {
            score -= (self.consecutive_identical_responses as f64 * 0.2).min(0.5);
        }
        if self.consecutive_minimal_responses > 0 {
            score -= (self.consecutive_minimal_responses as f64 * 0.1).min(0.3);
        }
        if self.is_stuck_in_state(STUCK_STATE_THRESHOLD) {
            score -= 0.3;
        }
        // Idle time weighs in too: five minutes without a meaningful action
        // is the maximum penalty.
        score -= (self.seconds_since_meaningful_action() / 300.0).min(0.2);
        score.max(0.0)
    }

    fn reset_counters(&mut self) {
        self.consecutive_empty_responses = 0;
        self.consecutive_identical_responses = 0;
        self.consecutive_minimal_responses = 0;
        self.cycles_in_current_state = 0;
        self.recent_hashes.clear();
        self.last_meaningful_action = Instant::now();
    }
}

/// Process-wide health monitor.
pub struct HealthMonitor {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        HealthMonitor {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record one cycle's output for `agent_id`.
    pub async fn record_agent_cycle(
        &self,
        agent_id: &str,
        content: &str,
        has_action: bool,
        has_thought: bool,
        current_state: &str,
    ) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(agent_id.to_string())
            .or_insert_with(HealthRecord::new);
        record.record_response(content, has_action, has_thought, current_state);
    }

    /// Current health score, 1.0 when the agent has no record yet.
    pub async fn health_score(&self, agent_id: &str) -> f64 {
        let records = self.records.lock().await;
        records.get(agent_id).map_or(1.0, |r| r.health_score())
    }

    pub async fn record_snapshot(&self, agent_id: &str) -> Option<(u32, u32, u32, u32)> {
        let records = self.records.lock().await;
        records.get(agent_id).map(|r| {
            (
                r.consecutive_empty_responses,
                r.consecutive_identical_responses,
                r.consecutive_minimal_responses,
                r.cycles_in_current_state,
            )
        })
    }

    /// Check thresholds for the agent and produce an intervention plan.
    /// Bootstrap agents are exempt.
    pub async fn analyze_agent_health(&self, agent: &Agent) -> Option<InterventionPlan> {
        if agent.is_bootstrap() || agent.kind == AgentKind::Guardian {
            return None;
        }
        let records = self.records.lock().await;
        let record = records.get(&agent.agent_id)?;

        let kind = if record.consecutive_empty_responses >= EMPTY_RESPONSE_THRESHOLD {
            ViolationKind::EmptyResponseViolation
        } else if record.consecutive_identical_responses >= IDENTICAL_RESPONSE_THRESHOLD {
            ViolationKind::IdenticalResponseViolation
        } else if record.consecutive_minimal_responses >= MINIMAL_RESPONSE_THRESHOLD {
            ViolationKind::MinimalResponsePattern
        } else if record.is_stuck_in_state(STUCK_STATE_THRESHOLD) {
            ViolationKind::StuckStatePattern
        } else {
            return None;
        };

        warn!(
            "Health violation for '{}': {} (score {:.2})",
            agent.agent_id,
            kind.as_str(),
            record.health_score()
        );
        Some(InterventionPlan {
            agent_id: agent.agent_id.clone(),
            kind,
            guidance: Self::guidance_for(agent, kind, record),
            clear_context: kind.is_critical(),
            schedule_immediately: kind.is_critical(),
        })
    }

    fn guidance_for(agent: &Agent, kind: ViolationKind, record: &HealthRecord) -> String {
        let prefix = if kind.is_critical() {
            "[Constitutional Guardian - CRITICAL VIOLATION]"
        } else {
            "[Constitutional Guardian - Intervention]"
        };
        let body = match kind {
            ViolationKind::EmptyResponseViolation => format!(
                "You have produced {} consecutive empty responses. You must produce concrete \
                 output this cycle: call a tool, send a message, or request a state change \
                 appropriate for your current state '{}'.",
                record.consecutive_empty_responses, agent.state
            ),
            ViolationKind::IdenticalResponseViolation => format!(
                "You have repeated the same response {} times in a row. You are stuck in a \
                 loop. Take a different action than your last response: re-read the latest \
                 messages in your history and act on them.",
                record.consecutive_identical_responses
            ),
            ViolationKind::MinimalResponsePattern => format!(
                "Your last {} responses contained thinking but no substantive output. Stop \
                 deliberating and take a concrete action for state '{}'.",
                record.consecutive_minimal_responses, agent.state
            ),
            ViolationKind::StuckStatePattern => format!(
                "You have spent {} cycles in state '{}' without completing it. Either finish \
                 the state's objective now or request a transition to the next state.",
                record.cycles_in_current_state, agent.state
            ),
        };
        format!("{} {}", prefix, body)
    }

    /// Apply a plan to the agent: inject guidance, optionally clear context,
    /// reset counters and status. Returns `true` when the caller should
    /// schedule an immediate cycle.
    pub async fn apply_intervention(&self, agent: &mut Agent, plan: &InterventionPlan) -> bool {
        if plan.clear_context {
            clear_problematic_context(agent);
        }
        agent
            .message_history
            .push(Message::framework(MessageRole::SystemIntervention, plan.guidance.clone()));
        agent.status = AgentStatus::Idle;

        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&agent.agent_id) {
            record.reset_counters();
            record.interventions.push(plan.kind.as_str());
        }
        info!(
            "Applied {} intervention to '{}'",
            plan.kind.as_str(),
            agent.agent_id
        );
        plan.schedule_immediately
    }

    /// Reset the pattern counters after a cycle that took meaningful action.
    pub async fn reset_counters(&self, agent_id: &str) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(agent_id) {
            record.consecutive_empty_responses = 0;
            record.consecutive_identical_responses = 0;
            record.consecutive_minimal_responses = 0;
        }
    }

    pub async fn forget_agent(&self, agent_id: &str) {
        self.records.lock().await.remove(agent_id);
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a message matches a known contamination pattern. `role=tool`
/// messages are never contaminated; their content is not interpretable.
pub fn is_contaminated(message: &Message) -> bool {
    if message.role == MessageRole::Tool {
        return false;
    }
    let content = message.text();
    if content.is_empty() {
        return false;
    }
    CONTAMINATION_PATTERNS.iter().any(|p| p.is_match(content))
}

/// Remove contaminated messages from a history in place; returns how many
/// were removed. The leading system prompt is always preserved.
pub fn clean_contaminated_history(history: &mut Vec<Message>) -> usize {
    let before = history.len();
    let mut index = 0;
    history.retain(|msg| {
        let keep = index == 0 && msg.role == MessageRole::System || !is_contaminated(msg);
        index += 1;
        keep
    });
    before - history.len()
}

/// Drop everything but the system prompt and the most recent few messages.
fn clear_problematic_context(agent: &mut Agent) {
    let history = &mut agent.message_history;
    if history.len() <= CONTEXT_KEEP_RECENT + 1 {
        return;
    }
    let system = history
        .first()
        .filter(|m| m.role == MessageRole::System)
        .cloned();
    let recent: Vec<Message> = history[history.len() - CONTEXT_KEEP_RECENT..].to_vec();
    history.clear();
    if let Some(system) = system {
        history.push(system);
    }
    history.extend(recent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Agent {
        Agent::new("w1", AgentKind::Worker, "Coder", "p", "m")
    }

    #[tokio::test]
    async fn test_empty_response_violation_after_two() {
        let monitor = HealthMonitor::new();
        let agent = worker();
        monitor
            .record_agent_cycle("w1", "", false, false, "work")
            .await;
        assert!(monitor.analyze_agent_health(&agent).await.is_none());
        monitor
            .record_agent_cycle("w1", "", false, false, "work")
            .await;
        let plan = monitor.analyze_agent_health(&agent).await.unwrap();
        assert_eq!(plan.kind, ViolationKind::EmptyResponseViolation);
        assert!(plan.schedule_immediately);
        assert!(plan.guidance.starts_with("[Constitutional Guardian - CRITICAL VIOLATION]"));
    }

    #[tokio::test]
    async fn test_identical_responses_detected() {
        let monitor = HealthMonitor::new();
        let agent = worker();
        monitor
            .record_agent_cycle("w1", "same text", false, false, "work")
            .await;
        monitor
            .record_agent_cycle("w1", "same text", false, false, "work")
            .await;
        monitor
            .record_agent_cycle("w1", "same text", false, false, "work")
            .await;
        let plan = monitor.analyze_agent_health(&agent).await.unwrap();
        assert_eq!(plan.kind, ViolationKind::IdenticalResponseViolation);
    }

    #[tokio::test]
    async fn test_meaningful_action_resets_counters() {
        let monitor = HealthMonitor::new();
        monitor
            .record_agent_cycle("w1", "", false, false, "work")
            .await;
        monitor
            .record_agent_cycle("w1", "did a tool call", true, false, "work")
            .await;
        let (empty, identical, minimal, _) = monitor.record_snapshot("w1").await.unwrap();
        assert_eq!((empty, identical, minimal), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_stuck_state_detected() {
        let monitor = HealthMonitor::new();
        let agent = worker();
        for i in 0..STUCK_STATE_THRESHOLD {
            monitor
                .record_agent_cycle("w1", &format!("different text {}", i), false, false, "work")
                .await;
        }
        let plan = monitor.analyze_agent_health(&agent).await.unwrap();
        assert_eq!(plan.kind, ViolationKind::StuckStatePattern);
        assert!(!plan.schedule_immediately);
    }

    #[tokio::test]
    async fn test_bootstrap_exempt() {
        let monitor = HealthMonitor::new();
        let admin = Agent::new(
            crate::agentmesh::agent::BOOTSTRAP_ADMIN_ID,
            AgentKind::Admin,
            "Admin",
            "p",
            "m",
        );
        monitor
            .record_agent_cycle(&admin.agent_id, "", false, false, "conversation")
            .await;
        monitor
            .record_agent_cycle(&admin.agent_id, "", false, false, "conversation")
            .await;
        assert!(monitor.analyze_agent_health(&admin).await.is_none());
    }

    #[tokio::test]
    async fn test_apply_intervention_resets_agent() {
        let monitor = HealthMonitor::new();
        let mut agent = worker();
        agent.status = AgentStatus::Processing;
        agent.set_system_prompt("system".into());
        for i in 0..8 {
            agent.message_history.push(Message::user(format!("m{}", i)));
        }
        monitor.record_agent_cycle("w1", "", false, false, "work").await;
        monitor.record_agent_cycle("w1", "", false, false, "work").await;
        let plan = monitor.analyze_agent_health(&agent).await.unwrap();
        let schedule = monitor.apply_intervention(&mut agent, &plan).await;
        assert!(schedule);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.message_history[0].role, MessageRole::System);
        // Context cleared to system + recent + injected guidance.
        assert!(agent.message_history.len() <= 6);
        assert_eq!(
            agent.message_history.last().unwrap().role,
            MessageRole::SystemIntervention
        );
        let (empty, _, _, _) = monitor.record_snapshot("w1").await.unwrap();
        assert_eq!(empty, 0);
    }

    #[test]
    fn test_contamination_matcher() {
        let bad = Message::assistant(
            "<tool_information><action>execute</action><tool_name>file_system</tool_name>\
             <parameters>action=read</parameters></tool_information>",
        );
        assert!(is_contaminated(&bad));
        let tool_msg = Message::tool_result("c1", "file_system", "Invalid or missing 'action'. Must be 'list_tools' or 'get_info'");
        assert!(!is_contaminated(&tool_msg));
        let fine = Message::assistant("All tasks are complete.");
        assert!(!is_contaminated(&fine));
    }

    #[test]
    fn test_clean_history_keeps_system_prompt() {
        let mut history = vec![
            Message::system("prompt"),
            Message::assistant("<tool_information><action>execute</action><tool_name>x</tool_name>y</tool_information>"),
            Message::user("hello"),
        ];
        let removed = clean_contaminated_history(&mut history);
        assert_eq!(removed, 1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::System);
    }
}
