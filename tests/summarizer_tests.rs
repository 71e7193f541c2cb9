use agentmesh::agent::{Message, MessageRole};
use agentmesh::provider::StreamEvent;
use agentmesh::summarizer::{estimate_token_count, should_summarize, summarize_history};

mod common;
use common::ScriptedProvider;

fn long_history(messages: usize) -> Vec<Message> {
    let mut history = vec![Message::system("You are a worker agent.")];
    for i in 0..messages {
        history.push(Message::user(format!("instruction number {}", i)));
        history.push(Message::assistant(format!("acknowledged {}", i)));
    }
    history
}

/// Context summarization end to end: the condensed history starts with the
/// original system prompt followed by the two summary markers, and is
/// strictly shorter than the original.
#[tokio::test]
async fn test_condensed_history_shape_and_monotonicity() {
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "First half: the worker received instructions.".to_string(),
        }])
        .await;
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "Second half: the worker acknowledged everything.".to_string(),
        }])
        .await;

    let history = long_history(15);
    let condensed = summarize_history(
        &provider,
        "llama3",
        None,
        "Summarize the conversation.",
        "worker_1",
        &history,
    )
    .await
    .expect("summarization should succeed");

    assert!(condensed.len() < history.len());
    assert_eq!(condensed[0].role, MessageRole::System);
    assert_eq!(condensed[0].text(), "You are a worker agent.");
    assert!(condensed[1].text().starts_with("[CONTEXT SUMMARY 1/2"));
    assert!(condensed[2].text().starts_with("[CONTEXT SUMMARY 2/2"));
    // The last original message survives verbatim.
    assert_eq!(
        condensed.last().unwrap().text(),
        history.last().unwrap().text()
    );
}

#[tokio::test]
async fn test_failed_summarization_keeps_original() {
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    // First chunk summary comes back empty -> the whole pass fails.
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: String::new(),
        }])
        .await;
    let history = long_history(10);
    let result = summarize_history(
        &provider,
        "llama3",
        None,
        "Summarize.",
        "worker_1",
        &history,
    )
    .await;
    assert!(result.is_none());
}

#[tokio::test]
async fn test_short_history_not_summarized() {
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    let history = vec![Message::system("s"), Message::user("u")];
    assert!(
        summarize_history(&provider, "llama3", None, "Summarize.", "a", &history)
            .await
            .is_none()
    );
    assert_eq!(provider.request_count().await, 0);
}

#[test]
fn test_trigger_threshold_is_80_percent() {
    // 8192-token model: the trigger sits at 6553.6 estimated tokens.
    let mut history = vec![Message::system("x")];
    while !should_summarize(estimate_token_count(&history), 8192) {
        history.push(Message::user("y".repeat(400)));
        if history.len() > 200 {
            panic!("threshold never reached");
        }
    }
    let estimate = estimate_token_count(&history);
    assert!(estimate as f64 > 8192.0 * 0.8);
    history.pop();
    assert!(!should_summarize(estimate_token_count(&history), 8192));
}
