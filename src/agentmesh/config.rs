//! Runtime configuration.
//!
//! [`Settings`] is a plain struct users construct however they want — no
//! config-file parsing dependencies are introduced here. Every knob the
//! runtime recognizes is a field; defaults match a single-machine deployment
//! with local models.

use std::collections::HashMap;
use std::path::PathBuf;

/// Policy filter selecting which discovered models are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Only local providers.
    Local,
    /// Local providers plus remote models whose id carries the `:free`
    /// suffix convention.
    Free,
    /// Every reachable model.
    All,
}

impl ModelTier {
    pub fn parse(s: &str) -> Option<ModelTier> {
        match s.to_ascii_uppercase().as_str() {
            "LOCAL" => Some(ModelTier::Local),
            "FREE" => Some(ModelTier::Free),
            "ALL" => Some(ModelTier::All),
            _ => None,
        }
    }
}

/// One governance principle reviewed by the guardian and injected into
/// system prompts.
#[derive(Debug, Clone)]
pub struct GovernancePrinciple {
    pub id: String,
    pub name: String,
    pub text: String,
    /// Agent kinds this principle applies to (`"admin"`, `"pm"`, `"worker"`,
    /// or `"all"`).
    pub applies_to: Vec<String>,
    pub enabled: bool,
}

/// Global runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model_tier: ModelTier,
    /// Whole-cycle retry attempts before the agent is parked in error.
    pub max_stream_retries: u32,
    /// Delay between cycle retries.
    pub retry_delay_seconds: f64,
    /// Hard ceiling of internal turns within one cycle.
    pub max_cycle_turns: u32,
    /// Period of the PM conversation→manage sweep.
    pub pm_manage_check_interval_seconds: f64,
    /// Fallback build-team target when a PM has no explicit target.
    pub max_workers_per_pm: u32,
    /// Enable scanning non-loopback addresses for local model endpoints.
    pub local_api_scan_enabled: bool,
    pub local_api_scan_ports: Vec<u16>,
    /// Per-probe timeout for the local scan, in seconds.
    pub local_api_scan_timeout: f64,
    /// provider → ordered key list.
    pub provider_api_keys: HashMap<String, Vec<String>>,
    /// Overrides for the built-in prompt templates, keyed by template name.
    pub prompts: HashMap<String, String>,
    pub governance_principles: Vec<GovernancePrinciple>,
    /// Root under which per-project sandboxes are created.
    pub projects_base_dir: PathBuf,
    /// Default context window assumed for models that do not report one.
    pub default_model_max_tokens: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            model_tier: ModelTier::All,
            max_stream_retries: 3,
            retry_delay_seconds: 5.0,
            max_cycle_turns: 10,
            pm_manage_check_interval_seconds: 60.0,
            max_workers_per_pm: 3,
            local_api_scan_enabled: false,
            local_api_scan_ports: vec![11434, 1234, 8000],
            local_api_scan_timeout: 0.5,
            provider_api_keys: HashMap::new(),
            prompts: HashMap::new(),
            governance_principles: Vec::new(),
            projects_base_dir: PathBuf::from("projects"),
            default_model_max_tokens: 8192,
        }
    }
}

impl Settings {
    /// Principles applying to the given agent kind, enabled ones only.
    pub fn principles_for(&self, kind: &str) -> Vec<&GovernancePrinciple> {
        self.governance_principles
            .iter()
            .filter(|p| {
                p.enabled
                    && p.applies_to
                        .iter()
                        .any(|a| a == kind || a == "all")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse() {
        assert_eq!(ModelTier::parse("local"), Some(ModelTier::Local));
        assert_eq!(ModelTier::parse("FREE"), Some(ModelTier::Free));
        assert_eq!(ModelTier::parse("All"), Some(ModelTier::All));
        assert_eq!(ModelTier::parse("premium"), None);
    }

    #[test]
    fn test_principles_filtering() {
        let mut settings = Settings::default();
        settings.governance_principles = vec![
            GovernancePrinciple {
                id: "p1".into(),
                name: "No secrets".into(),
                text: "Never reveal credentials.".into(),
                applies_to: vec!["all".into()],
                enabled: true,
            },
            GovernancePrinciple {
                id: "p2".into(),
                name: "PM only".into(),
                text: "Assign tasks before reporting.".into(),
                applies_to: vec!["pm".into()],
                enabled: true,
            },
            GovernancePrinciple {
                id: "p3".into(),
                name: "Disabled".into(),
                text: "ignored".into(),
                applies_to: vec!["all".into()],
                enabled: false,
            },
        ];
        let admin = settings.principles_for("admin");
        assert_eq!(admin.len(), 1);
        let pm = settings.principles_for("pm");
        assert_eq!(pm.len(), 2);
    }
}
