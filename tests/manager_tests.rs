use std::sync::Arc;
use std::time::Duration;

use agentmesh::agent::{AgentStatus, MessageRole, BOOTSTRAP_ADMIN_ID};
use agentmesh::config::Settings;
use agentmesh::interaction;
use agentmesh::manager::AgentManager;
use agentmesh::provider::StreamEvent;

mod common;
use common::{temp_dir, wait_for_idle, CollectingSink, ScriptedProvider};

async fn setup(tag: &str) -> (Arc<AgentManager>, Arc<ScriptedProvider>, Arc<CollectingSink>) {
    let dir = temp_dir(tag);
    let mut settings = Settings::default();
    settings.projects_base_dir = dir.join("projects");
    settings.retry_delay_seconds = 0.01;
    let manager = AgentManager::new(settings, &dir.join("data")).unwrap();
    let provider = Arc::new(ScriptedProvider::new("mock-local", true));
    manager.register_provider(provider.clone()).await;
    let sink = CollectingSink::new();
    manager.add_ui_sink(sink.clone()).await;
    manager.bootstrap("mock-local", "mock-model").await;
    (manager, provider, sink)
}

#[tokio::test]
async fn test_user_message_schedules_idle_admin() {
    let (manager, provider, _sink) = setup("user_msg").await;
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "Hello! How can I help?".to_string(),
        }])
        .await;

    manager.handle_user_message("hi there").await;
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;

    let admin = manager.get_agent(BOOTSTRAP_ADMIN_ID).await.unwrap();
    let guard = admin.read().await;
    assert!(guard
        .message_history
        .iter()
        .any(|m| m.role == MessageRole::User && m.text() == "hi there"));
    assert!(guard
        .message_history
        .iter()
        .any(|m| m.role == MessageRole::Assistant && m.text().contains("How can I help")));
    assert_eq!(guard.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_at_most_one_cycle_in_flight() {
    let dir = temp_dir("single_flight");
    let mut settings = Settings::default();
    settings.projects_base_dir = dir.join("projects");
    let manager = AgentManager::new(settings, &dir.join("data")).unwrap();
    let provider = Arc::new(
        ScriptedProvider::new("mock-local", true).with_delay(Duration::from_millis(250)),
    );
    manager.register_provider(provider.clone()).await;
    manager.bootstrap("mock-local", "mock-model").await;

    assert!(manager.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await);
    // A second schedule while the first is in flight is refused.
    assert!(!manager.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await);
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;
    // Once finished, scheduling works again.
    assert!(manager.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await);
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;
}

#[tokio::test]
async fn test_bootstrap_agents_cannot_be_deleted() {
    let (manager, _provider, _sink) = setup("bootstrap_delete").await;
    assert!(manager.delete_agent_instance(BOOTSTRAP_ADMIN_ID).await.is_err());
    assert!(manager.delete_agent_instance("guardian").await.is_err());

    let worker_id = manager
        .create_agent_instance("Coder", None, None, None, None, None, None)
        .await
        .unwrap();
    assert!(manager.delete_agent_instance(&worker_id).await.is_ok());
    assert!(manager.get_agent(&worker_id).await.is_none());
}

#[tokio::test]
async fn test_routing_policy_blocks_cross_team_messages() {
    let (manager, _provider, _sink) = setup("routing").await;
    let worker_a = manager
        .create_agent_instance("Coder A", None, None, None, None, Some("team_a"), None)
        .await
        .unwrap();
    let worker_b = manager
        .create_agent_instance("Coder B", None, None, None, None, Some("team_b"), None)
        .await
        .unwrap();

    interaction::route_and_activate_agent_message(&manager, &worker_a, &worker_b, "psst").await;

    let sender = manager.get_agent(&worker_a).await.unwrap();
    let blocked = sender
        .read()
        .await
        .message_history
        .iter()
        .any(|m| m.text().contains("Message blocked"));
    assert!(blocked);

    let target = manager.get_agent(&worker_b).await.unwrap();
    assert!(target.read().await.message_history.is_empty());
}

#[tokio::test]
async fn test_routing_same_team_delivers_and_activates() {
    let (manager, _provider, _sink) = setup("routing_ok").await;
    let worker_a = manager
        .create_agent_instance("Coder A", None, None, None, None, Some("team_a"), None)
        .await
        .unwrap();
    let worker_b = manager
        .create_agent_instance("Coder B", None, None, None, None, Some("team_a"), None)
        .await
        .unwrap();

    interaction::route_and_activate_agent_message(&manager, &worker_a, &worker_b, "ping").await;
    wait_for_idle(&manager, &worker_b).await;

    let target = manager.get_agent(&worker_b).await.unwrap();
    let delivered = target
        .read()
        .await
        .message_history
        .iter()
        .any(|m| m.role == MessageRole::User && m.text().contains("ping") && m.text().starts_with("[From @"));
    assert!(delivered);
}

#[tokio::test]
async fn test_admin_reaches_everyone() {
    let (manager, _provider, _sink) = setup("routing_admin").await;
    let worker = manager
        .create_agent_instance("Loner", None, None, None, None, None, None)
        .await
        .unwrap();

    interaction::route_and_activate_agent_message(&manager, BOOTSTRAP_ADMIN_ID, &worker, "status?")
        .await;
    wait_for_idle(&manager, &worker).await;

    let target = manager.get_agent(&worker).await.unwrap();
    assert!(target
        .read()
        .await
        .message_history
        .iter()
        .any(|m| m.text().contains("status?")));
}

#[tokio::test]
async fn test_persona_resolution_and_ambiguity() {
    let (manager, _provider, _sink) = setup("persona").await;
    let worker = manager
        .create_agent_instance("Database Expert", None, None, None, None, None, None)
        .await
        .unwrap();

    // Unique persona resolves.
    interaction::route_and_activate_agent_message(
        &manager,
        BOOTSTRAP_ADMIN_ID,
        "Database Expert",
        "hello",
    )
    .await;
    wait_for_idle(&manager, &worker).await;
    let target = manager.get_agent(&worker).await.unwrap();
    assert!(target
        .read()
        .await
        .message_history
        .iter()
        .any(|m| m.text().contains("hello")));

    // Duplicate persona becomes ambiguous.
    manager
        .create_agent_instance("Database Expert", None, None, None, None, None, None)
        .await
        .unwrap();
    interaction::route_and_activate_agent_message(
        &manager,
        BOOTSTRAP_ADMIN_ID,
        "Database Expert",
        "which one?",
    )
    .await;
    let admin = manager.get_agent(BOOTSTRAP_ADMIN_ID).await.unwrap();
    assert!(admin
        .read()
        .await
        .message_history
        .iter()
        .any(|m| m.text().contains("ambiguous")));
}

#[tokio::test]
async fn test_project_creation_gates_pm_on_approval() {
    let (manager, provider, sink) = setup("project").await;
    let pm_id = manager
        .create_project_and_pm_agent("Snake Game", "Build a snake game in JS.")
        .await
        .unwrap();

    // Pending approval: scheduling is refused.
    assert!(!manager.schedule_cycle(&pm_id, 0).await);
    assert!(sink
        .type_tags()
        .await
        .contains(&"project_pending_approval"));

    // The initial task was seeded.
    let tasks = manager.project_tool.tasks_for("Snake Game").await;
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].description.starts_with("Project Plan:"));

    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "<think>planning</think><task_list><task>build board</task></task_list>"
                .to_string(),
        }])
        .await;
    manager.approve_project(&pm_id).await.unwrap();
    wait_for_idle(&manager, &pm_id).await;
    assert!(sink.type_tags().await.contains(&"project_approved"));
}
