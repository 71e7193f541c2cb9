//! Team membership state.
//!
//! Two maps kept bidirectionally consistent: `team → [agent ids]` and
//! `agent → team`. Every mutation updates both sides before returning, so a
//! reader can trust either direction.

use std::collections::HashMap;

use log::{info, warn};

/// Result message pair used by the manage_team signal handling.
pub type TeamOpResult = Result<String, String>;

/// Teams and agent↔team assignments.
#[derive(Debug, Default)]
pub struct TeamState {
    teams: HashMap<String, Vec<String>>,
    agent_to_team: HashMap<String, String>,
}

impl TeamState {
    pub fn new() -> Self {
        TeamState::default()
    }

    pub fn create_team(&mut self, team_id: &str) -> TeamOpResult {
        if team_id.is_empty() {
            return Err("Team ID cannot be empty.".to_string());
        }
        if self.teams.contains_key(team_id) {
            return Err(format!("Team '{}' already exists.", team_id));
        }
        self.teams.insert(team_id.to_string(), Vec::new());
        info!("Team '{}' created", team_id);
        Ok(format!("Team '{}' created successfully.", team_id))
    }

    /// Delete an empty team; a team with members must be emptied first.
    pub fn delete_team(&mut self, team_id: &str) -> TeamOpResult {
        if team_id.is_empty() {
            return Err("Team ID cannot be empty.".to_string());
        }
        match self.teams.get(team_id) {
            None => Err(format!("Team '{}' not found.", team_id)),
            Some(members) if !members.is_empty() => Err(format!(
                "Team '{}' is not empty. Remove agents first. Members: {:?}",
                team_id, members
            )),
            Some(_) => {
                self.teams.remove(team_id);
                info!("Team '{}' deleted", team_id);
                Ok(format!("Team '{}' deleted successfully.", team_id))
            }
        }
    }

    /// Add an agent to a team, creating the team if needed and moving the
    /// agent out of any previous team.
    pub fn add_agent_to_team(&mut self, agent_id: &str, team_id: &str) -> TeamOpResult {
        if agent_id.is_empty() || team_id.is_empty() {
            return Err("Agent ID and Team ID cannot be empty.".to_string());
        }
        if !self.teams.contains_key(team_id) {
            self.teams.insert(team_id.to_string(), Vec::new());
            info!("Team '{}' auto-created for '{}'", team_id, agent_id);
        }
        if self.agent_to_team.get(agent_id).map(String::as_str) == Some(team_id) {
            return Ok(format!("Agent '{}' is already in team '{}'.", agent_id, team_id));
        }
        if let Some(old_team) = self.agent_to_team.get(agent_id).cloned() {
            if let Some(members) = self.teams.get_mut(&old_team) {
                members.retain(|m| m != agent_id);
            }
        }
        self.teams
            .get_mut(team_id)
            .map(|members| members.push(agent_id.to_string()));
        self.agent_to_team
            .insert(agent_id.to_string(), team_id.to_string());
        info!("Agent '{}' added to team '{}'", agent_id, team_id);
        Ok(format!("Agent '{}' added to team '{}'.", agent_id, team_id))
    }

    pub fn remove_agent_from_team(&mut self, agent_id: &str, team_id: &str) -> TeamOpResult {
        if agent_id.is_empty() || team_id.is_empty() {
            return Err("Agent ID and Team ID cannot be empty.".to_string());
        }
        if !self.teams.contains_key(team_id) {
            if self.agent_to_team.get(agent_id).map(String::as_str) != Some(team_id) {
                return Ok(format!(
                    "Agent '{}' was not assigned to non-existent team '{}'.",
                    agent_id, team_id
                ));
            }
            self.agent_to_team.remove(agent_id);
            warn!("Cleaned dangling team mapping for '{}'", agent_id);
            return Err(format!(
                "Team '{}' not found, but the agent mapping existed (cleaned up).",
                team_id
            ));
        }
        if self.agent_to_team.get(agent_id).map(String::as_str) != Some(team_id) {
            return Err(format!(
                "Agent '{}' is not recorded as being in team '{}'.",
                agent_id, team_id
            ));
        }
        if let Some(members) = self.teams.get_mut(team_id) {
            members.retain(|m| m != agent_id);
        }
        self.agent_to_team.remove(agent_id);
        info!("Agent '{}' removed from team '{}'", agent_id, team_id);
        Ok(format!("Agent '{}' removed from team '{}'.", agent_id, team_id))
    }

    /// Drop all membership for an agent that is being deleted.
    pub fn remove_agent_everywhere(&mut self, agent_id: &str) {
        if let Some(team) = self.agent_to_team.remove(agent_id) {
            if let Some(members) = self.teams.get_mut(&team) {
                members.retain(|m| m != agent_id);
            }
        }
    }

    pub fn team_of(&self, agent_id: &str) -> Option<&str> {
        self.agent_to_team.get(agent_id).map(String::as_str)
    }

    pub fn members_of(&self, team_id: &str) -> Option<&[String]> {
        self.teams.get(team_id).map(Vec::as_slice)
    }

    pub fn team_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.teams.clone()
    }

    pub fn agent_map_snapshot(&self) -> HashMap<String, String> {
        self.agent_to_team.clone()
    }

    /// Overwrite state from a session snapshot.
    pub fn load(&mut self, teams: HashMap<String, Vec<String>>, agent_to_team: HashMap<String, String>) {
        self.teams = teams;
        self.agent_to_team = agent_to_team;
        info!(
            "Team state loaded: {} team(s), {} assignment(s)",
            self.teams.len(),
            self.agent_to_team.len()
        );
    }

    pub fn clear(&mut self) {
        self.teams.clear();
        self.agent_to_team.clear();
    }

    /// Internal consistency check used by tests: every mapping has a
    /// matching list entry and vice versa.
    pub fn is_consistent(&self) -> bool {
        for (agent, team) in &self.agent_to_team {
            match self.teams.get(team) {
                Some(members) if members.contains(agent) => {}
                _ => return false,
            }
        }
        for (team, members) in &self.teams {
            for member in members {
                if self.agent_to_team.get(member).map(String::as_str) != Some(team.as_str()) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_move_remove_keeps_consistency() {
        let mut state = TeamState::new();
        state.create_team("t1").unwrap();
        state.add_agent_to_team("w1", "t1").unwrap();
        assert!(state.is_consistent());
        assert_eq!(state.team_of("w1"), Some("t1"));

        // Move to an auto-created team.
        state.add_agent_to_team("w1", "t2").unwrap();
        assert!(state.is_consistent());
        assert_eq!(state.team_of("w1"), Some("t2"));
        assert!(state.members_of("t1").unwrap().is_empty());

        state.remove_agent_from_team("w1", "t2").unwrap();
        assert!(state.is_consistent());
        assert_eq!(state.team_of("w1"), None);
    }

    #[test]
    fn test_delete_nonempty_team_rejected() {
        let mut state = TeamState::new();
        state.add_agent_to_team("w1", "t1").unwrap();
        assert!(state.delete_team("t1").is_err());
        state.remove_agent_everywhere("w1");
        assert!(state.delete_team("t1").is_ok());
    }

    #[test]
    fn test_duplicate_team_rejected() {
        let mut state = TeamState::new();
        state.create_team("t1").unwrap();
        assert!(state.create_team("t1").is_err());
    }
}
