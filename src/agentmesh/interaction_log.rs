//! Append-only interaction log and knowledge store.
//!
//! Both stores persist as newline-delimited JSON, one record per line,
//! append-only, so a crash can lose at most the final partial line. The
//! interaction log is the evidence trail for health interventions and history
//! reconstruction; the knowledge store keeps distilled agent thoughts
//! searchable by keyword and importance.
//!
//! The only mutation besides append is [`InteractionLog::delete_where_ids`],
//! used by the contaminated-history sweep; it rewrites the file through a
//! temp-file-then-rename so readers never observe a torn log.

use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agentmesh::agent::MessageRole;

/// One persisted agent-visible event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: u64,
    pub session_id: String,
    pub agent_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls_json: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results_json: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

struct LogInner {
    records: Vec<InteractionRecord>,
    next_id: u64,
}

/// Append-only JSONL interaction log.
pub struct InteractionLog {
    inner: Mutex<LogInner>,
    path: PathBuf,
}

impl InteractionLog {
    /// Open (or create) the log at `path`, replaying existing lines to
    /// recover the id counter. Unparseable lines are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut records = Vec::new();
        if path.exists() {
            let file = std::fs::File::open(&path)?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InteractionRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(
                        "Skipping unparseable interaction log line {}: {}",
                        line_no + 1,
                        e
                    ),
                }
            }
        }
        let next_id = records.iter().map(|r| r.id).max().map_or(1, |max| max + 1);
        info!(
            "Interaction log opened at {} ({} records)",
            path.display(),
            records.len()
        );
        Ok(InteractionLog {
            inner: Mutex::new(LogInner { records, next_id }),
            path,
        })
    }

    /// Append one record and return its id.
    pub async fn log_interaction(
        &self,
        session_id: &str,
        agent_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls_json: Option<serde_json::Value>,
        tool_results_json: Option<serde_json::Value>,
    ) -> io::Result<u64> {
        let mut inner = self.inner.lock().await;
        let record = InteractionRecord {
            id: inner.next_id,
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            content: content.to_string(),
            tool_calls_json,
            tool_results_json,
            timestamp: Utc::now(),
        };
        inner.next_id += 1;
        append_line(&self.path, &record)?;
        let id = record.id;
        inner.records.push(record);
        Ok(id)
    }

    /// All records for one session, in append order.
    pub async fn records_for_session(&self, session_id: &str) -> Vec<InteractionRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Snapshot of every record.
    pub async fn all_records(&self) -> Vec<InteractionRecord> {
        self.inner.lock().await.records.clone()
    }

    /// Delete the given record ids, rewriting the file atomically. Returns
    /// how many records were removed. `role=tool` records are never deleted
    /// regardless of the id set: their content is not interpretable by the
    /// contamination matcher and the in-memory cleanup applies the same
    /// exemption.
    pub async fn delete_where_ids(&self, ids: &HashSet<u64>) -> io::Result<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner
            .records
            .retain(|r| r.role == MessageRole::Tool || !ids.contains(&r.id));
        let removed = before - inner.records.len();
        if removed > 0 {
            rewrite_all(&self.path, &inner.records)?;
            info!("Deleted {} interaction record(s)", removed);
        }
        Ok(removed)
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> io::Result<()> {
    let json = serde_json::to_string(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)
}

fn rewrite_all(path: &Path, records: &[InteractionRecord]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for record in records {
            let json = serde_json::to_string(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{}", json)?;
        }
    }
    std::fs::rename(&tmp, path)
}

/// One distilled, searchable knowledge entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Comma-separated keyword list, matched by substring.
    pub keywords: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_interaction_id: Option<u64>,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

/// JSONL-backed knowledge store.
pub struct KnowledgeStore {
    items: Mutex<Vec<KnowledgeItem>>,
    path: PathBuf,
}

impl KnowledgeStore {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut items = Vec::new();
        if path.exists() {
            let file = std::fs::File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<KnowledgeItem>(&line) {
                    Ok(item) => items.push(item),
                    Err(e) => error!("Skipping unparseable knowledge line: {}", e),
                }
            }
        }
        Ok(KnowledgeStore {
            items: Mutex::new(items),
            path,
        })
    }

    /// Persist one entry; keywords are extracted from the summary when the
    /// caller provides none.
    pub async fn save_knowledge(
        &self,
        session_id: Option<&str>,
        keywords: Option<&str>,
        summary: &str,
        source_interaction_id: Option<u64>,
        importance: f64,
    ) -> io::Result<KnowledgeItem> {
        let keywords = match keywords {
            Some(k) if !k.trim().is_empty() => k.trim().to_string(),
            _ => extract_keywords(summary, 5).join(", "),
        };
        let item = KnowledgeItem {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.map(String::from),
            keywords,
            summary: summary.to_string(),
            source_interaction_id,
            importance,
            created_at: Utc::now(),
        };
        append_line(&self.path, &item)?;
        self.items.lock().await.push(item.clone());
        Ok(item)
    }

    /// Entries whose keyword list contains `keyword_filter` as a substring
    /// (case-insensitive) and whose importance meets the threshold, newest
    /// first.
    pub async fn search(&self, keyword_filter: &str, min_importance: f64) -> Vec<KnowledgeItem> {
        let needle = keyword_filter.to_lowercase();
        let items = self.items.lock().await;
        let mut matches: Vec<KnowledgeItem> = items
            .iter()
            .filter(|item| {
                item.importance >= min_importance
                    && (needle.is_empty() || item.keywords.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "should", "can", "could", "may", "might", "must", "and",
    "but", "or", "nor", "for", "so", "yet", "if", "then", "while", "because", "since", "until",
    "after", "before", "when", "where", "why", "how", "what", "which", "who", "whom", "whose",
    "with", "without", "within", "into", "onto", "from", "about", "against", "during", "not",
    "no", "never", "ever", "always", "very", "just", "also", "too", "this", "that", "these",
    "those", "you", "your", "our", "their", "its", "all", "any", "some", "such", "other",
];

/// Extract up to `max_keywords` frequency-ranked keywords from free text.
///
/// Lowercases, strips punctuation (keeping intra-word hyphens), drops stop
/// words, purely numeric tokens, and words shorter than three characters.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut counts: Vec<(String, usize)> = Vec::new();
    for raw_word in text.to_lowercase().split_whitespace() {
        let cleaned: String = raw_word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        let cleaned = cleaned.trim_matches('-');
        if cleaned.len() < 3
            || STOP_WORDS.iter().any(|w| *w == cleaned)
            || cleaned.chars().all(|c| c.is_numeric() || c == '-')
        {
            continue;
        }
        match counts.iter_mut().find(|(word, _)| word == cleaned) {
            Some((_, count)) => *count += 1,
            None => counts.push((cleaned.to_string(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(max_keywords).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "agentmesh_log_{}_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4(),
            name
        ))
    }

    #[tokio::test]
    async fn test_log_append_and_reload() {
        let path = temp_path("interactions.jsonl");
        {
            let log = InteractionLog::open(&path).unwrap();
            log.log_interaction("s1", "admin_ai", MessageRole::User, "hello", None, None)
                .await
                .unwrap();
            log.log_interaction("s1", "admin_ai", MessageRole::Assistant, "hi", None, None)
                .await
                .unwrap();
        }
        let log = InteractionLog::open(&path).unwrap();
        let records = log.records_for_session("s1").await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        // The id counter resumes past existing records.
        let id = log
            .log_interaction("s1", "admin_ai", MessageRole::User, "again", None, None)
            .await
            .unwrap();
        assert_eq!(id, 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_delete_exempts_tool_records() {
        let path = temp_path("interactions.jsonl");
        let log = InteractionLog::open(&path).unwrap();
        let id1 = log
            .log_interaction("s1", "a", MessageRole::Assistant, "bad", None, None)
            .await
            .unwrap();
        let id2 = log
            .log_interaction("s1", "a", MessageRole::Tool, "result", None, None)
            .await
            .unwrap();
        let mut ids = HashSet::new();
        ids.insert(id1);
        ids.insert(id2);
        let removed = log.delete_where_ids(&ids).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = log.records_for_session("s1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].role, MessageRole::Tool);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_knowledge_search() {
        let path = temp_path("knowledge.jsonl");
        let store = KnowledgeStore::open(&path).unwrap();
        store
            .save_knowledge(Some("s1"), Some("database, schema"), "Schema uses JSONL", None, 0.8)
            .await
            .unwrap();
        store
            .save_knowledge(Some("s1"), Some("frontend"), "UI is a websocket client", None, 0.3)
            .await
            .unwrap();
        let hits = store.search("schema", 0.5).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].summary.contains("JSONL"));
        let none = store.search("frontend", 0.5).await;
        assert!(none.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_extract_keywords() {
        let keywords = extract_keywords(
            "The agent needs to use the file system tool. File system access is critical.",
            5,
        );
        assert!(keywords.contains(&"file".to_string()));
        assert!(keywords.contains(&"system".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(extract_keywords("", 5).is_empty());
        assert!(extract_keywords("123 456", 5).is_empty());
    }
}
