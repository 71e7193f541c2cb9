use agentmesh::agent::{Agent, AgentKind, BOOTSTRAP_ADMIN_ID};
use agentmesh::prompts::PromptLibrary;
use agentmesh::workflow::{AgentDirectoryEntry, PromptInputs, WorkflowManager};

mod common;

fn entry(id: &str, kind: AgentKind, persona: &str, project: Option<&str>, team: Option<&str>) -> AgentDirectoryEntry {
    AgentDirectoryEntry {
        agent_id: id.to_string(),
        kind,
        persona: persona.to_string(),
        project_name: project.map(String::from),
        team_id: team.map(String::from),
    }
}

fn population() -> Vec<AgentDirectoryEntry> {
    vec![
        entry(BOOTSTRAP_ADMIN_ID, AgentKind::Admin, "Admin", None, None),
        entry("pm_alpha", AgentKind::Pm, "Alpha PM", Some("alpha"), None),
        entry("pm_beta", AgentKind::Pm, "Beta PM", Some("beta"), None),
        entry("worker_a1", AgentKind::Worker, "Coder", Some("alpha"), Some("team_alpha")),
        entry("worker_a2", AgentKind::Worker, "Tester", Some("alpha"), Some("team_alpha")),
        entry("worker_b1", AgentKind::Worker, "Coder", Some("beta"), Some("team_beta")),
    ]
}

fn inputs<'a>(
    population: &'a [AgentDirectoryEntry],
    prompts: &'a PromptLibrary,
    team: Option<&str>,
    project: &str,
) -> PromptInputs<'a> {
    PromptInputs {
        population,
        team_id: team.map(String::from),
        project_name: project.to_string(),
        session_name: "s1".to_string(),
        prompts,
        principles: &[],
    }
}

/// Address book correctness: each role sees exactly the peers the role
/// rules mandate and no others.
#[test]
fn test_address_book_mentions_exactly_mandated_peers() {
    let wf = WorkflowManager::new();
    let prompts = PromptLibrary::new(Default::default());
    let population = population();

    // Admin: all PMs, no workers.
    let admin = Agent::new(BOOTSTRAP_ADMIN_ID, AgentKind::Admin, "Admin", "p", "m");
    let prompt = wf.get_system_prompt(&admin, &inputs(&population, &prompts, None, "N/A"));
    assert!(prompt.contains("pm_alpha"));
    assert!(prompt.contains("pm_beta"));
    assert!(!prompt.contains("worker_a1"));
    assert!(!prompt.contains("worker_b1"));

    // PM alpha: admin, own-project workers, peer PMs — not beta's workers.
    let mut pm = Agent::new("pm_alpha", AgentKind::Pm, "Alpha PM", "p", "m");
    pm.project_name = Some("alpha".to_string());
    let prompt = wf.get_system_prompt(&pm, &inputs(&population, &prompts, None, "alpha"));
    assert!(prompt.contains(BOOTSTRAP_ADMIN_ID));
    assert!(prompt.contains("worker_a1"));
    assert!(prompt.contains("worker_a2"));
    assert!(prompt.contains("pm_beta"));
    assert!(!prompt.contains("worker_b1"));

    // Worker a1: admin, its PM, its team members — nothing from beta.
    let mut worker = Agent::new("worker_a1", AgentKind::Worker, "Coder", "p", "m");
    worker.project_name = Some("alpha".to_string());
    worker.state = "work".to_string();
    let prompt = wf.get_system_prompt(
        &worker,
        &inputs(&population, &prompts, Some("team_alpha"), "alpha"),
    );
    assert!(prompt.contains(BOOTSTRAP_ADMIN_ID));
    assert!(prompt.contains("pm_alpha"));
    assert!(prompt.contains("worker_a2"));
    assert!(!prompt.contains("worker_b1"));
    assert!(!prompt.contains("pm_beta"));
}

/// State validity: after every change_state the agent's state is in the
/// legal set for its kind.
#[test]
fn test_state_always_legal_after_change() {
    let wf = WorkflowManager::new();
    let attempts = [
        "startup",
        "work",
        "manage",
        "build_team_tasks",
        "activate_workers",
        "standby",
        "conversation",
        "planning",
        "wait",
        "nonsense",
        "pm_manage",
        "worker_wait",
    ];
    for kind in [AgentKind::Admin, AgentKind::Pm, AgentKind::Worker] {
        let mut agent = Agent::new("a", kind, "A", "p", "m");
        for requested in attempts {
            let _ = wf.change_state(&mut agent, requested);
            assert!(
                wf.is_valid_state(kind, &agent.state),
                "kind {:?} ended in illegal state '{}' after '{}'",
                kind,
                agent.state,
                requested
            );
        }
    }
}

/// Idempotent transition: re-requesting the current state changes nothing
/// except the documented PM manage flag.
#[test]
fn test_idempotent_transition() {
    let wf = WorkflowManager::new();
    let mut pm = Agent::new("pm1", AgentKind::Pm, "PM", "p", "m");
    wf.change_state(&mut pm, "manage").unwrap();
    assert!(pm.pm_needs_initial_list_tools);
    let history_len = pm.message_history.len();
    let result = wf.change_state(&mut pm, "manage").unwrap();
    assert!(result.is_none());
    assert_eq!(pm.message_history.len(), history_len);
    assert_eq!(pm.state, "manage");
    assert!(!pm.pm_needs_initial_list_tools);
}
