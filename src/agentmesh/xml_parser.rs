//! XML tool-call extraction and recovery.
//!
//! LLMs invoke tools by emitting `<tool_name>…</tool_name>` blocks, raw or
//! wrapped in markdown fences, and they get the format wrong in predictable
//! ways. This module finds every candidate block for the registered tool
//! names, sanitizes it, parses the flat parameter children, and reports
//! either a valid call or a parsing error carrying a corrective example.
//!
//! A separate best-effort [`recover_xml`] pass rewrites the known
//! malformations before full parsing is retried:
//!
//! - markdown fences wrapping the XML;
//! - a missing opening bracket (`tool_name><action>…`);
//! - the `tool_information → execute` confusion, where the agent wraps a
//!   real tool invocation inside `tool_information` with
//!   `<parameters>action=…</parameters>`;
//! - a missing closing tag at the end of the buffer.
//!
//! The parser accepts only the flat shape tool calls actually use: a root
//! element whose children are leaf parameters. Nested markup inside a
//! parameter value is a parse error, matching the tool contract.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::agentmesh::tool_protocol::ToolSchema;

lazy_static! {
    /// `<request_state state='pm_manage'/>` — emitted inline by agents.
    pub static ref REQUEST_STATE_RE: Regex =
        Regex::new(r#"<request_state\s+state=['"]([A-Za-z0-9_]+)['"]\s*/>"#).unwrap();
    static ref CHILD_ELEMENT_RE: Regex =
        Regex::new(r"(?s)<([A-Za-z0-9_]+)>(.*?)</([A-Za-z0-9_]+)>").unwrap();
    static ref SELF_CLOSING_CHILD_RE: Regex =
        Regex::new(r"<([A-Za-z0-9_]+)\s*/>").unwrap();
    static ref FENCE_RE: Regex = Regex::new(r"(?s)```(?:[A-Za-z0-9_]+)?\s*(.*?)\s*```").unwrap();
    static ref MALFORMED_TOOL_INFO_RE: Regex = Regex::new(
        r"(?s)<tool_information>\s*<action>execute</action>\s*<tool_name>([^<]+)</tool_name>\s*<parameters>([^<]+)</parameters>\s*</tool_information>"
    )
    .unwrap();
    static ref PARAMS_ACTION_RE: Regex = Regex::new(r"action=([A-Za-z0-9_]+)").unwrap();
}

/// One successfully parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool_name: String,
    pub args: HashMap<String, String>,
    /// Byte span of the block within the original buffer.
    pub span: (usize, usize),
}

/// A block that looked like a call for a known tool but failed to parse.
#[derive(Debug, Clone)]
pub struct ToolParseError {
    pub tool_name: String,
    /// Diagnostic including a corrective usage example.
    pub error_message: String,
    /// The original block text.
    pub xml_block: String,
    pub span: (usize, usize),
    pub is_markdown: bool,
}

/// Combined outcome of one extraction pass.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub valid_calls: Vec<ParsedToolCall>,
    pub parsing_errors: Vec<ToolParseError>,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.valid_calls.is_empty() && self.parsing_errors.is_empty()
    }
}

/// Result of the best-effort recovery pass.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub recovered_xml: String,
    pub was_modified: bool,
    pub applied_fixes: Vec<String>,
}

fn html_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn spans_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0.max(b.0) < a.1.min(b.1)
}

/// Strip fences/prefixes and trailing junk so the block starts at the root
/// opening tag and ends right after the root closing tag.
fn sanitize_block(block: &str, tool_name: &str) -> String {
    let mut cleaned = block.trim().to_string();

    for prefix in ["```xml", "```", "xml"] {
        let lower = cleaned.to_ascii_lowercase();
        if lower.starts_with(prefix) {
            cleaned = cleaned[prefix.len()..].trim_start().to_string();
        }
    }
    for suffix in ["```", "`"] {
        if cleaned.ends_with(suffix) {
            cleaned = cleaned[..cleaned.len() - suffix.len()].trim_end().to_string();
        }
    }

    if !cleaned.starts_with('<') {
        let open = format!("<{}", tool_name);
        if let Some(idx) = cleaned.to_ascii_lowercase().find(&open.to_ascii_lowercase()) {
            cleaned = cleaned[idx..].to_string();
        }
    }

    let close = format!("</{}>", tool_name);
    if let Some(idx) = cleaned.to_ascii_lowercase().rfind(&close.to_ascii_lowercase()) {
        cleaned.truncate(idx + close.len());
    }

    // Undo double-escaped entities before the parse sees them.
    cleaned.replace("&amp;lt;", "&lt;").replace("&amp;gt;", "&gt;")
}

/// Parse a sanitized block as one flat tool call: a root element whose
/// children are leaf parameters.
fn parse_flat_call(
    block: &str,
    tool_name: &str,
    schema: Option<&ToolSchema>,
) -> Result<HashMap<String, String>, String> {
    let trimmed = block.trim();

    let self_closing = format!("<{}/>", tool_name);
    if trimmed.eq_ignore_ascii_case(&self_closing) {
        return Ok(HashMap::new());
    }

    let open_re = Regex::new(&format!(r"(?is)^<{}\b[^>]*>", regex::escape(tool_name)))
        .map_err(|e| e.to_string())?;
    let open_match = open_re.find(trimmed).ok_or_else(|| {
        format!(
            "XML root tag does not match expected tool name '{}'. Expected: <{}>…</{}>{}",
            tool_name,
            tool_name,
            tool_name,
            corrective_suffix(tool_name, schema)
        )
    })?;

    let close = format!("</{}>", tool_name);
    let close_idx = trimmed
        .to_ascii_lowercase()
        .rfind(&close.to_ascii_lowercase())
        .ok_or_else(|| {
            format!(
                "Missing closing tag </{}>.{}",
                tool_name,
                corrective_suffix(tool_name, schema)
            )
        })?;
    if close_idx < open_match.end() {
        return Err(format!(
            "Closing tag </{}> appears before the opening tag ends.{}",
            tool_name,
            corrective_suffix(tool_name, schema)
        ));
    }
    let inner = &trimmed[open_match.end()..close_idx];

    let mut args = HashMap::new();
    let mut consumed: Vec<(usize, usize)> = Vec::new();

    for caps in CHILD_ELEMENT_RE.captures_iter(inner) {
        let open_tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let close_tag = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        if open_tag != close_tag {
            return Err(format!(
                "Mismatched tags <{}>…</{}> — opening and closing tag names must match exactly.{}",
                open_tag,
                close_tag,
                corrective_suffix(tool_name, schema)
            ));
        }
        let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if value.contains('<') {
            return Err(format!(
                "Parameter <{}> contains nested markup; parameter values must be plain text \
                 (escape special characters: & as &amp;, < as &lt;, > as &gt;).{}",
                open_tag,
                corrective_suffix(tool_name, schema)
            ));
        }
        args.insert(open_tag.to_string(), html_unescape(value.trim()));
        let whole = caps.get(0).unwrap();
        consumed.push((whole.start(), whole.end()));
    }
    for caps in SELF_CLOSING_CHILD_RE.captures_iter(inner) {
        let whole = caps.get(0).unwrap();
        if consumed.iter().any(|c| spans_overlap(*c, (whole.start(), whole.end()))) {
            continue;
        }
        args.insert(caps[1].to_string(), String::new());
        consumed.push((whole.start(), whole.end()));
    }

    // Anything tag-like left over means the structure is not well-formed.
    let mut leftovers = inner.to_string();
    consumed.sort_by_key(|c| std::cmp::Reverse(c.0));
    for (start, end) in consumed {
        leftovers.replace_range(start..end, "");
    }
    if leftovers.contains('<') || leftovers.contains('>') {
        return Err(format!(
            "The XML structure is not well-formed (unclosed or stray tag inside <{}>).{}",
            tool_name,
            corrective_suffix(tool_name, schema)
        ));
    }

    Ok(args)
}

fn corrective_suffix(tool_name: &str, schema: Option<&ToolSchema>) -> String {
    let example = match schema {
        Some(schema) => schema.usage_example(),
        None => format!("<{}><action>example_action</action></{}>", tool_name, tool_name),
    };
    format!(" Correct format:\n{}", example)
}

/// Find and parse every XML tool call for the given schemas.
///
/// Scans for raw and markdown-fenced blocks per registered tool name,
/// de-duplicates overlapping spans (first match wins in buffer order), and
/// validates required parameters against the schema — missing ones are
/// logged by callers but do not fail the parse, since tools report their own
/// argument errors.
pub fn find_and_parse_xml_tool_calls(text: &str, schemas: &[ToolSchema]) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    if text.trim().is_empty() {
        return outcome;
    }

    struct Candidate {
        span: (usize, usize),
        block: String,
        tool_name: String,
        is_markdown: bool,
    }

    let mut candidates: Vec<Candidate> = Vec::new();

    for schema in schemas {
        let name = schema.name;
        let raw_re = match Regex::new(&format!(
            r"(?is)<{name}\b[^>]*>.*?</{name}\s*>|<{name}\s*/>",
            name = regex::escape(name)
        )) {
            Ok(re) => re,
            Err(_) => continue,
        };
        for m in raw_re.find_iter(text) {
            candidates.push(Candidate {
                span: (m.start(), m.end()),
                block: m.as_str().to_string(),
                tool_name: name.to_string(),
                is_markdown: false,
            });
        }
    }

    // Markdown-fenced blocks: attribute the fence span so the raw match
    // inside is treated as overlapping.
    for caps in FENCE_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        for schema in schemas {
            let open = format!("<{}", schema.name);
            if inner.to_ascii_lowercase().contains(&open.to_ascii_lowercase()) {
                candidates.push(Candidate {
                    span: (whole.start(), whole.end()),
                    block: inner.to_string(),
                    tool_name: schema.name.to_string(),
                    is_markdown: true,
                });
                break;
            }
        }
    }

    // Wider spans first at equal start so a fence swallows its raw match.
    candidates.sort_by(|a, b| a.span.0.cmp(&b.span.0).then(b.span.1.cmp(&a.span.1)));

    let mut processed: Vec<(usize, usize)> = Vec::new();
    let schema_by_name: HashMap<&str, &ToolSchema> =
        schemas.iter().map(|s| (s.name, s)).collect();

    for candidate in candidates {
        if processed.iter().any(|span| spans_overlap(*span, candidate.span)) {
            continue;
        }
        let schema = schema_by_name.get(candidate.tool_name.as_str()).copied();
        let sanitized = sanitize_block(&candidate.block, &candidate.tool_name);
        match parse_flat_call(&sanitized, &candidate.tool_name, schema) {
            Ok(args) => {
                outcome.valid_calls.push(ParsedToolCall {
                    tool_name: candidate.tool_name,
                    args,
                    span: candidate.span,
                });
            }
            Err(error_message) => {
                outcome.parsing_errors.push(ToolParseError {
                    tool_name: candidate.tool_name,
                    error_message,
                    xml_block: candidate.block,
                    span: candidate.span,
                    is_markdown: candidate.is_markdown,
                });
            }
        }
        processed.push(candidate.span);
    }

    outcome
}

/// Best-effort rewrite of known malformations. Returns the (possibly
/// unchanged) text plus a record of which fixes were applied.
pub fn recover_xml(text: &str, known_tool_names: &[&str]) -> RecoveryResult {
    let mut content = text.trim().to_string();
    let mut applied_fixes = Vec::new();

    // Fences around XML. Hand-rolled rather than regex so that a tool name
    // missing its opening bracket (```tool_information>) is not mistaken
    // for a fence language tag.
    if let (Some(first), Some(last)) = (content.find("```"), content.rfind("```")) {
        if last > first + 3 {
            let mut inner = content[first + 3..last].trim().to_string();
            if let Some(rest) = inner.strip_prefix("xml") {
                let rest_trimmed = rest.trim_start();
                if rest_trimmed.starts_with('<')
                    || looks_like_bracketless_call(rest_trimmed, known_tool_names)
                {
                    inner = rest_trimmed.to_string();
                }
            }
            if inner.contains('<') || looks_like_bracketless_call(&inner, known_tool_names) {
                content = inner;
                applied_fixes.push("Removed markdown code fences".to_string());
            }
        }
    }

    // tool_information's execute confusion.
    let execute_form = MALFORMED_TOOL_INFO_RE.captures(&content).map(|caps| {
        (
            caps[1].trim().to_string(),
            caps[2].to_string(),
            caps.get(0).map(|m| m.range()).unwrap_or(0..0),
        )
    });
    if let Some((target_tool, parameters, range)) = execute_form {
        if let Some(action_caps) = PARAMS_ACTION_RE.captures(&parameters) {
            let action = action_caps[1].to_string();
            let replacement = match action.as_str() {
                "list_tools" => {
                    "<tool_information><action>list_tools</action></tool_information>".to_string()
                }
                "get_info" => format!(
                    "<tool_information><action>get_info</action><tool_name>{}</tool_name></tool_information>",
                    target_tool
                ),
                other => format!("<{}><action>{}</action></{}>", target_tool, other, target_tool),
            };
            content.replace_range(range, &replacement);
            applied_fixes.push(format!(
                "Rewrote malformed tool_information execute form targeting '{}'",
                target_tool
            ));
        }
    }

    // Missing opening bracket: `tool_name><action>…`. Only for known tool
    // names, and only where the name is not already preceded by `<` or `/`.
    for name in known_tool_names {
        let pattern = format!("{}>", name);
        let mut search_from = 0;
        while let Some(rel) = content[search_from..].find(&pattern) {
            let idx = search_from + rel;
            let preceded_by = content[..idx].chars().last();
            let opens_cleanly = matches!(preceded_by, None)
                || matches!(preceded_by, Some(c) if c.is_whitespace() || c == '`');
            if opens_cleanly {
                content.insert(idx, '<');
                applied_fixes.push("Fixed malformed opening bracket".to_string());
                search_from = idx + pattern.len() + 1;
            } else {
                search_from = idx + pattern.len();
            }
        }
    }

    // Opening tag with no closing tag at end of buffer.
    for name in known_tool_names {
        let open_re = match Regex::new(&format!(r"(?i)<{}\b", regex::escape(name))) {
            Ok(re) => re,
            Err(_) => continue,
        };
        let self_close_re = match Regex::new(&format!(r"(?i)<{}\b[^>]*/>", regex::escape(name))) {
            Ok(re) => re,
            Err(_) => continue,
        };
        let close = format!("</{}>", name);
        if open_re.is_match(&content)
            && !self_close_re.is_match(&content)
            && !content.to_ascii_lowercase().contains(&close.to_ascii_lowercase())
        {
            content.push_str(&close);
            applied_fixes.push(format!("Added missing closing tag for {}", name));
        }
    }

    RecoveryResult {
        was_modified: !applied_fixes.is_empty(),
        recovered_xml: content,
        applied_fixes,
    }
}

fn looks_like_bracketless_call(text: &str, known_tool_names: &[&str]) -> bool {
    known_tool_names
        .iter()
        .any(|name| text.starts_with(&format!("{}>", name)))
}

/// Extract a `<request_state state='…'/>` request from assistant text.
pub fn find_request_state(text: &str) -> Option<String> {
    REQUEST_STATE_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
}
