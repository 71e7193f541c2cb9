use agentmesh::guardian::{parse_verdict, review_final_response, GuardianVerdict, ReviewOutcome};
use agentmesh::provider::{ProviderError, StreamEvent};

mod common;
use common::ScriptedProvider;

#[tokio::test]
async fn test_ok_verdict_approves() {
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "<OK/>".to_string(),
        }])
        .await;
    let outcome = review_final_response(
        &provider,
        "llama3",
        None,
        "You are the Guardian.".to_string(),
        "All tasks are complete.",
    )
    .await;
    assert_eq!(outcome, ReviewOutcome::Approved);
}

#[tokio::test]
async fn test_concern_verdict_carries_details() {
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "<CONCERN>The response reveals an internal credential.</CONCERN>".to_string(),
        }])
        .await;
    let outcome = review_final_response(
        &provider,
        "llama3",
        None,
        "You are the Guardian.".to_string(),
        "here is the api key",
    )
    .await;
    match outcome {
        ReviewOutcome::Concern { details } => {
            assert!(details.contains("internal credential"));
        }
        other => panic!("expected concern, got {:?}", other),
    }
}

/// Fail-open: empty input, malformed verdicts and provider errors all
/// resolve to approval.
#[tokio::test]
async fn test_fail_open_paths() {
    // Empty input never reaches the LLM.
    let provider = ScriptedProvider::new("ollama-local-11434", true);
    let outcome =
        review_final_response(&provider, "llama3", None, "prompt".to_string(), "   ").await;
    assert_eq!(outcome, ReviewOutcome::Approved);
    assert_eq!(provider.request_count().await, 0);

    // Malformed verdict.
    provider
        .push_script(vec![StreamEvent::FinalResponse {
            content: "I find this acceptable, mostly.".to_string(),
        }])
        .await;
    let outcome =
        review_final_response(&provider, "llama3", None, "prompt".to_string(), "text").await;
    assert_eq!(outcome, ReviewOutcome::Approved);

    // Provider error mid-stream.
    provider
        .push_script(vec![StreamEvent::Error {
            error: ProviderError::provider_down("connection refused"),
        }])
        .await;
    let outcome =
        review_final_response(&provider, "llama3", None, "prompt".to_string(), "text").await;
    assert_eq!(outcome, ReviewOutcome::Approved);
}

#[test]
fn test_verdict_parser_classification() {
    assert_eq!(parse_verdict("<OK/>"), GuardianVerdict::Ok);
    assert!(matches!(
        parse_verdict("<CONCERN>bad</CONCERN>"),
        GuardianVerdict::Concern { .. }
    ));
    assert!(matches!(parse_verdict(""), GuardianVerdict::Malformed { .. }));
    assert!(matches!(
        parse_verdict("<CONCERN>half open"),
        GuardianVerdict::Malformed { .. }
    ));
}
