//! Project/session context and snapshot persistence.
//!
//! A session scopes one run of the system: every logged interaction carries
//! the active `(project, session)` pair, and the session snapshot file
//! captures enough state (teams, agent-to-team assignments, dynamic agent
//! configurations, and agent histories) to reconstruct the dynamic part of
//! the population after a restart. Snapshots are written atomically.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::agentmesh::agent::{AgentKind, Message};

/// Configuration snapshot of one dynamically created agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAgentConfig {
    pub agent_id: String,
    pub kind: AgentKind,
    pub persona: String,
    pub provider_name: String,
    pub model_id: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// Everything persisted per (project, session).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub teams: HashMap<String, Vec<String>>,
    pub agent_to_team: HashMap<String, String>,
    pub dynamic_agents_config: Vec<DynamicAgentConfig>,
    pub agent_histories: HashMap<String, Vec<Message>>,
}

/// Active project/session identifiers plus snapshot I/O.
#[derive(Debug)]
pub struct SessionManager {
    base_dir: PathBuf,
    current_project: Option<String>,
    current_session: Option<String>,
}

impl SessionManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        SessionManager {
            base_dir: base_dir.into(),
            current_project: None,
            current_session: None,
        }
    }

    pub fn current_project(&self) -> Option<&str> {
        self.current_project.as_deref()
    }

    pub fn current_session(&self) -> Option<&str> {
        self.current_session.as_deref()
    }

    /// Activate a (project, session) pair, creating identifiers as needed.
    /// Returns the session id.
    pub fn ensure_active(&mut self) -> String {
        if self.current_project.is_none() {
            self.current_project = Some("default-project".to_string());
        }
        if self.current_session.is_none() {
            let session = format!("session-{}", uuid::Uuid::new_v4());
            info!(
                "Starting session '{}' in project '{}'",
                session,
                self.current_project.as_deref().unwrap_or("?")
            );
            self.current_session = Some(session);
        }
        self.current_session.clone().unwrap_or_default()
    }

    pub fn set_project(&mut self, project: impl Into<String>) {
        self.current_project = Some(project.into());
    }

    fn snapshot_path(&self, project: &str, session: &str) -> PathBuf {
        self.base_dir
            .join(sanitize_component(project))
            .join(format!("{}.json", sanitize_component(session)))
    }

    /// Write the snapshot for the active pair atomically. No-op when no
    /// session is active.
    pub fn save_snapshot(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        let (project, session) = match (&self.current_project, &self.current_session) {
            (Some(p), Some(s)) => (p.clone(), s.clone()),
            _ => return Ok(()),
        };
        let path = self.snapshot_path(&project, &session);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        info!("Session snapshot saved to {}", path.display());
        Ok(())
    }

    /// Load the snapshot for a (project, session) pair, if one exists.
    pub fn load_snapshot(&self, project: &str, session: &str) -> Option<SessionSnapshot> {
        let path = self.snapshot_path(project, session);
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    error!("Invalid session snapshot {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                error!("Cannot read session snapshot {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::agent::MessageRole;

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "agentmesh_session_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        let mut manager = SessionManager::new(&dir);
        manager.set_project("demo project");
        let session = manager.ensure_active();

        let mut snapshot = SessionSnapshot::default();
        snapshot.teams.insert("t1".to_string(), vec!["w1".to_string()]);
        snapshot
            .agent_to_team
            .insert("w1".to_string(), "t1".to_string());
        snapshot.dynamic_agents_config.push(DynamicAgentConfig {
            agent_id: "w1".to_string(),
            kind: AgentKind::Worker,
            persona: "Coder".to_string(),
            provider_name: "ollama-local-11434".to_string(),
            model_id: "llama3".to_string(),
            temperature: 0.7,
            system_prompt: None,
            project_name: Some("demo project".to_string()),
        });
        snapshot.agent_histories.insert(
            "w1".to_string(),
            vec![Message::system("prompt"), Message::user("task")],
        );
        manager.save_snapshot(&snapshot).unwrap();

        let loaded = manager.load_snapshot("demo project", &session).unwrap();
        assert_eq!(loaded.teams["t1"], vec!["w1"]);
        assert_eq!(loaded.dynamic_agents_config.len(), 1);
        assert_eq!(loaded.agent_histories["w1"][0].role, MessageRole::System);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
