use std::sync::Arc;
use std::time::Duration;

use agentmesh::agent::{Message, MessageRole, BOOTSTRAP_ADMIN_ID};
use agentmesh::config::Settings;
use agentmesh::event::UiEvent;
use agentmesh::interaction;
use agentmesh::manager::AgentManager;
use agentmesh::provider::StreamEvent;

mod common;
use common::{temp_dir, wait_for_idle, CollectingSink, ScriptedProvider};

async fn setup(
    tag: &str,
    delay: Option<Duration>,
) -> (Arc<AgentManager>, Arc<ScriptedProvider>, Arc<CollectingSink>) {
    let dir = temp_dir(tag);
    let mut settings = Settings::default();
    settings.projects_base_dir = dir.join("projects");
    settings.retry_delay_seconds = 0.01;
    let manager = AgentManager::new(settings, &dir.join("data")).unwrap();
    let mut provider = ScriptedProvider::new("mock-local", true);
    if let Some(delay) = delay {
        provider = provider.with_delay(delay);
    }
    let provider = Arc::new(provider);
    manager.register_provider(provider.clone()).await;
    let sink = CollectingSink::new();
    manager.add_ui_sink(sink.clone()).await;
    manager.bootstrap("mock-local", "mock-model").await;
    (manager, provider, sink)
}

/// A message arriving while a cycle is in flight sets the priority-recheck
/// flag, and the cycle restarts its turn to pick the message up.
#[tokio::test]
async fn test_priority_recheck_restarts_turn() {
    let (manager, provider, _sink) = setup("recheck", Some(Duration::from_millis(250))).await;
    let worker_id = manager
        .create_agent_instance("Messenger", None, None, None, None, None, None)
        .await
        .unwrap();

    // Turn 1 final response, then its guardian verdict; turn 2 (after the
    // recheck) and its verdict come from the default script.
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "first answer".to_string(),
        }])
        .await;
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "<OK/>".to_string(),
        }])
        .await;

    manager.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await;
    // Land a message mid-turn, while the provider is still "streaming".
    tokio::time::sleep(Duration::from_millis(100)).await;
    interaction::route_and_activate_agent_message(
        &manager,
        &worker_id,
        BOOTSTRAP_ADMIN_ID,
        "urgent update",
    )
    .await;
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;

    let admin = manager.get_agent(BOOTSTRAP_ADMIN_ID).await.unwrap();
    let guard = admin.read().await;
    assert!(guard
        .message_history
        .iter()
        .any(|m| m.role == MessageRole::User && m.text().contains("urgent update")));
    assert!(!guard.needs_priority_recheck);
    // The restarted turn produced a second completion request for the admin
    // (plus guardian reviews).
    drop(guard);
    assert!(provider.request_count().await >= 3);
}

/// A malformed tool call that the recovery pass can repair is executed and
/// announced with an `xml_recovery_success` event.
#[tokio::test]
async fn test_malformed_tool_call_recovered_and_executed() {
    let (manager, provider, sink) = setup("xml_recovery", None).await;
    provider
        .push_script(vec![StreamEvent::MalformedToolCall {
            tool_name: "tool_information".to_string(),
            error_message: "XML root tag missing opening bracket".to_string(),
            raw_text: "```tool_information><action>list_tools</action></tool_information>```"
                .to_string(),
        }])
        .await;
    manager.schedule_cycle(BOOTSTRAP_ADMIN_ID, 0).await;
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_for_idle(&manager, BOOTSTRAP_ADMIN_ID).await;

    let events = sink.events.lock().await;
    let recovered = events.iter().any(|e| {
        matches!(
            e,
            UiEvent::XmlRecoverySuccess {
                recovered_calls: 1,
                ..
            }
        )
    });
    assert!(recovered, "expected xml_recovery_success with one call");
    drop(events);

    // The recovered list_tools call actually executed: its result landed in
    // the admin's history as a tool message.
    let admin = manager.get_agent(BOOTSTRAP_ADMIN_ID).await.unwrap();
    let guard = admin.read().await;
    assert!(guard
        .message_history
        .iter()
        .any(|m| m.role == MessageRole::Tool && m.text().contains("tool(s) available")));
}

/// The contaminated-history sweep removes poisoned messages from histories
/// and matching rows from the interaction log, leaving tool results alone.
#[tokio::test]
async fn test_contaminated_cleanup_sweeps_history_and_log() {
    let (manager, _provider, sink) = setup("cleanup", None).await;
    let worker_id = manager
        .create_agent_instance("Confused", None, None, None, None, None, None)
        .await
        .unwrap();

    let poison = "<tool_information><action>execute</action><tool_name>file_system</tool_name>\
                  <parameters>action=read</parameters></tool_information>";
    {
        let worker = manager.get_agent(&worker_id).await.unwrap();
        let mut guard = worker.write().await;
        guard.message_history.push(Message::system("prompt"));
        guard.message_history.push(Message::assistant(poison));
        guard.message_history.push(Message::user("carry on"));
        // Tool results are exempt even when their text matches.
        guard
            .message_history
            .push(Message::tool_result("c1", "tool_information", poison));
    }
    manager
        .log_interaction(&worker_id, MessageRole::Assistant, poison, None, None)
        .await;
    manager
        .log_interaction(&worker_id, MessageRole::User, "carry on", None, None)
        .await;

    manager.run_contaminated_cleanup().await;

    let worker = manager.get_agent(&worker_id).await.unwrap();
    let guard = worker.read().await;
    assert_eq!(guard.message_history.len(), 3);
    assert!(guard
        .message_history
        .iter()
        .all(|m| m.role == MessageRole::Tool || !m.text().contains("<action>execute</action>")));
    drop(guard);

    let remaining = manager.interaction_log.all_records().await;
    assert!(remaining.iter().all(|r| !r.content.contains("<action>execute</action>")
        || r.role == MessageRole::Tool));

    let events = sink.events.lock().await;
    let swept = events.iter().any(|e| {
        matches!(
            e,
            UiEvent::AutomaticContaminatedCleanup {
                messages_removed: 1,
                records_removed: 1,
            }
        )
    });
    assert!(swept, "expected a cleanup event with counts 1/1");
}
