//! Guardian verdicts on final responses.
//!
//! Every final response (except the guardian's own output) is shown to the
//! guardian agent together with the enabled governance principles. The
//! guardian answers `<OK/>` or `<CONCERN>…</CONCERN>`; anything else is
//! classified as malformed with a diagnostic.
//!
//! The review path is **fail-open**: empty input, an unparseable verdict, or
//! a provider error all resolve to `<OK/>`. A hung or broken guardian must
//! never deadlock the rest of the population.

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::agentmesh::provider::{
    collect_completion_text, CompletionRequest, ProviderAdapter,
};
use crate::agentmesh::agent::Message;

lazy_static! {
    static ref CONCERN_RE: Regex = Regex::new(r"(?s)<CONCERN>(.*?)</CONCERN>").unwrap();
}

/// Parsed guardian output.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardianVerdict {
    /// The text passes review.
    Ok,
    /// The text violates a principle; `details` is shown to the user.
    Concern { details: String },
    /// The guardian produced something that is neither verdict form.
    Malformed { diagnostic: String },
}

/// Classify raw guardian output.
pub fn parse_verdict(raw: &str) -> GuardianVerdict {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return GuardianVerdict::Malformed {
            diagnostic: "Guardian returned empty output.".to_string(),
        };
    }
    if trimmed == "<OK/>" {
        return GuardianVerdict::Ok;
    }
    if let Some(caps) = CONCERN_RE.captures(trimmed) {
        let details = caps[1].trim().to_string();
        if details.is_empty() {
            return GuardianVerdict::Malformed {
                diagnostic: "Guardian expressed a concern but the CONCERN block was empty."
                    .to_string(),
            };
        }
        return GuardianVerdict::Concern { details };
    }
    // Some models wrap the verdict in commentary; accept an embedded <OK/>.
    if trimmed.contains("<OK/>") {
        return GuardianVerdict::Ok;
    }
    if trimmed.contains("<CONCERN>") || trimmed.contains("</CONCERN>") {
        return GuardianVerdict::Malformed {
            diagnostic: format!(
                "Guardian expressed a concern but the format was malformed: {}",
                truncate(trimmed, 200)
            ),
        };
    }
    GuardianVerdict::Malformed {
        diagnostic: format!(
            "Guardian returned an inconclusive verdict: {}",
            truncate(trimmed, 200)
        ),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// Outcome of one review, with malformed/error cases already resolved
/// fail-open.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Approved,
    Concern { details: String },
}

/// Ask the guardian to review `text` against the principles baked into
/// `system_prompt`.
///
/// The conversation sent is exactly two messages: the guardian system prompt
/// and the text under review as the user message. Review temperature is
/// pinned low; the verdict is short so a small max_tokens suffices.
pub async fn review_final_response(
    adapter: &dyn ProviderAdapter,
    model: &str,
    api_key: Option<String>,
    system_prompt: String,
    text: &str,
) -> ReviewOutcome {
    if text.trim().is_empty() {
        return ReviewOutcome::Approved;
    }
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![Message::system(system_prompt), Message::user(text.to_string())],
        temperature: 0.1,
        max_tokens: Some(400),
        api_key,
    };
    let raw = match collect_completion_text(adapter, request).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Guardian review failed ({}); failing open", e);
            return ReviewOutcome::Approved;
        }
    };
    match parse_verdict(&raw) {
        GuardianVerdict::Ok => ReviewOutcome::Approved,
        GuardianVerdict::Concern { details } => {
            info!("Guardian raised a concern: {}", truncate(&details, 120));
            ReviewOutcome::Concern { details }
        }
        GuardianVerdict::Malformed { diagnostic } => {
            warn!("Guardian verdict malformed ({}); failing open", diagnostic);
            ReviewOutcome::Approved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok() {
        assert_eq!(parse_verdict("<OK/>"), GuardianVerdict::Ok);
        assert_eq!(parse_verdict("  <OK/>  "), GuardianVerdict::Ok);
        assert_eq!(
            parse_verdict("The text looks fine. <OK/>"),
            GuardianVerdict::Ok
        );
    }

    #[test]
    fn test_parse_concern() {
        match parse_verdict("<CONCERN>Reveals an API key</CONCERN>") {
            GuardianVerdict::Concern { details } => assert_eq!(details, "Reveals an API key"),
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_verdict(""), GuardianVerdict::Malformed { .. }));
        assert!(matches!(
            parse_verdict("<CONCERN>unterminated"),
            GuardianVerdict::Malformed { .. }
        ));
        assert!(matches!(
            parse_verdict("I think it is acceptable."),
            GuardianVerdict::Malformed { .. }
        ));
        assert!(matches!(
            parse_verdict("<CONCERN></CONCERN>"),
            GuardianVerdict::Malformed { .. }
        ));
    }
}
