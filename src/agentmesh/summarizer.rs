//! Context summarization via the guardian.
//!
//! When a cycle's token estimate crosses 80 % of the model's context window,
//! the history is split into two chunks (the system prompt is carried into
//! both), each chunk is summarized by the guardian agent, and the history is
//! replaced wholesale with `[system prompt, summary 1/2, summary 2/2,
//! last 10 original messages]`. A failed summarization leaves the original
//! history untouched — the cycle proceeds and may simply fail on length,
//! which the failover path then handles.

use chrono::Utc;
use log::{debug, info, warn};

use crate::agentmesh::agent::{Message, MessageRole};
use crate::agentmesh::provider::{collect_completion_text, CompletionRequest, ProviderAdapter};

/// Summarization trigger threshold, as a fraction of the model context.
pub const SUMMARIZE_THRESHOLD: f64 = 0.8;

/// Number of trailing original messages preserved verbatim.
const RECENT_MESSAGES_KEPT: usize = 10;

/// Per-message token overhead added on top of the character estimate.
const PER_MESSAGE_OVERHEAD: usize = 50;

/// Rough token estimate: ⌈total content chars / 4⌉ + 50 per message.
pub fn estimate_token_count(messages: &[Message]) -> usize {
    let total_chars: usize = messages.iter().map(|m| m.text().len()).sum();
    (total_chars + 3) / 4 + PER_MESSAGE_OVERHEAD * messages.len()
}

/// Whether the estimate crosses the summarization threshold for a model
/// with `max_tokens` of context.
pub fn should_summarize(estimated_tokens: usize, max_tokens: u32) -> bool {
    (estimated_tokens as f64) > (max_tokens as f64) * SUMMARIZE_THRESHOLD
}

/// Split the history into two roughly equal chunks with a small overlap,
/// duplicating the system prompt into both.
fn split_into_chunks(history: &[Message]) -> (Vec<Message>, Vec<Message>) {
    if history.len() <= 4 {
        let mid = history.len() / 2;
        return (
            history[..(mid + 1).min(history.len())].to_vec(),
            history[mid..].to_vec(),
        );
    }
    let system = history
        .first()
        .filter(|m| m.role == MessageRole::System)
        .cloned();
    let working: &[Message] = if system.is_some() { &history[1..] } else { history };

    let mid = working.len() / 2;
    let overlap_start = mid.saturating_sub(2);

    let mut chunk1 = Vec::new();
    let mut chunk2 = Vec::new();
    if let Some(system) = &system {
        chunk1.push(system.clone());
        chunk2.push(system.clone());
    }
    chunk1.extend_from_slice(&working[..mid]);
    chunk2.extend_from_slice(&working[overlap_start..]);
    (chunk1, chunk2)
}

fn format_chunk(chunk: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in chunk {
        let mut content = msg.text().to_string();
        if content.len() > 2000 {
            let mut end = 1900;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            content = format!("{}...[truncated]", &content[..end]);
        }
        lines.push(format!("[{}]: {}", msg.role.as_str().to_uppercase(), content));
    }
    lines.join("\n\n")
}

async fn summarize_chunk(
    adapter: &dyn ProviderAdapter,
    model: &str,
    api_key: Option<String>,
    summarize_system_prompt: &str,
    agent_id: &str,
    chunk: &[Message],
    chunk_num: usize,
) -> Option<String> {
    let prompt = format!(
        "Summarize this conversation chunk ({}/2) from agent '{}'.\n\n\
         CONVERSATION CHUNK TO SUMMARIZE:\n{}\n\n\
         Provide the summary as plain text:",
        chunk_num,
        agent_id,
        format_chunk(chunk)
    );
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![
            Message::system(summarize_system_prompt.to_string()),
            Message::user(prompt),
        ],
        temperature: 0.3,
        max_tokens: Some(800),
        api_key,
    };
    match collect_completion_text(adapter, request).await {
        Ok(summary) if !summary.trim().is_empty() => {
            debug!(
                "Chunk {} summary for '{}': {} chars",
                chunk_num,
                agent_id,
                summary.len()
            );
            Some(summary.trim().to_string())
        }
        Ok(_) => {
            warn!("Empty summary for chunk {} of '{}'", chunk_num, agent_id);
            None
        }
        Err(e) => {
            warn!("Summarization of chunk {} for '{}' failed: {}", chunk_num, agent_id, e);
            None
        }
    }
}

/// Produce the condensed replacement history, or `None` when summarization
/// could not complete (history too short, guardian unavailable, LLM error).
pub async fn summarize_history(
    adapter: &dyn ProviderAdapter,
    model: &str,
    api_key: Option<String>,
    summarize_system_prompt: &str,
    agent_id: &str,
    history: &[Message],
) -> Option<Vec<Message>> {
    if history.len() <= 3 {
        debug!("Agent '{}' history too short to summarize", agent_id);
        return None;
    }

    let (chunk1, chunk2) = split_into_chunks(history);
    let summary1 = summarize_chunk(
        adapter,
        model,
        api_key.clone(),
        summarize_system_prompt,
        agent_id,
        &chunk1,
        1,
    )
    .await?;
    let summary2 = summarize_chunk(
        adapter,
        model,
        api_key,
        summarize_system_prompt,
        agent_id,
        &chunk2,
        2,
    )
    .await?;

    let mut condensed = Vec::new();
    if let Some(first) = history.first() {
        if first.role == MessageRole::System {
            condensed.push(first.clone());
        }
    }
    let timestamp = Utc::now().to_rfc3339();
    condensed.push(Message::system(format!(
        "[CONTEXT SUMMARY 1/2 - {}]\n\n{}",
        timestamp, summary1
    )));
    condensed.push(Message::system(format!(
        "[CONTEXT SUMMARY 2/2 - {}]\n\n{}",
        timestamp, summary2
    )));

    let recent_start = history.len().saturating_sub(RECENT_MESSAGES_KEPT);
    for msg in &history[recent_start..] {
        if !condensed.contains(msg) {
            condensed.push(msg.clone());
        }
    }

    if condensed.len() >= history.len() {
        // Summarization must strictly shrink the history to be worth the swap.
        warn!(
            "Condensed history for '{}' not smaller ({} -> {}); keeping original",
            agent_id,
            history.len(),
            condensed.len()
        );
        return None;
    }

    info!(
        "Summarized history for '{}': {} -> {} messages",
        agent_id,
        history.len(),
        condensed.len()
    );
    Some(condensed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_of(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("system prompt")];
        for i in 0..n {
            messages.push(Message::user(format!("message number {}", i)));
        }
        messages
    }

    #[test]
    fn test_estimate_token_count() {
        let messages = vec![Message::user("abcd"), Message::user("efgh")];
        // 8 chars / 4 = 2 tokens + 2 * 50 overhead.
        assert_eq!(estimate_token_count(&messages), 102);
        // Ceiling division.
        let messages = vec![Message::user("abcde")];
        assert_eq!(estimate_token_count(&messages), 52);
    }

    #[test]
    fn test_should_summarize_threshold() {
        assert!(!should_summarize(800, 1000));
        assert!(should_summarize(801, 1000));
    }

    #[test]
    fn test_split_preserves_system_prompt_in_both() {
        let history = history_of(12);
        let (chunk1, chunk2) = split_into_chunks(&history);
        assert_eq!(chunk1[0].role, MessageRole::System);
        assert_eq!(chunk2[0].role, MessageRole::System);
        // Overlap: the two chunks together cover more than the original body.
        assert!(chunk1.len() + chunk2.len() > history.len());
    }
}
