//! API key rotation and quarantine.
//!
//! [`KeyManager`] holds the ordered key lists for every external provider and
//! hands out the next non-quarantined key round-robin. Keys that trigger
//! rate-limit/auth failures are quarantined for a TTL (default 24 h); the
//! quarantine map is persisted as JSON keyed by `"provider/fingerprint"` so a
//! restart does not forget which keys are burned. Expired entries are reaped
//! lazily on reads and eagerly before every save.
//!
//! Key material itself never reaches the persisted file — only the first 16
//! hex characters of the key's SHA-256 digest.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Default quarantine duration: 24 hours.
pub const DEFAULT_QUARANTINE_SECONDS: u64 = 86_400;

/// Short stable fingerprint of a key, safe to log and persist.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(clean_key(key).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Strip whitespace and the stray trailing `>` some template engines leave on
/// pasted keys.
fn clean_key(key: &str) -> &str {
    key.trim().trim_end_matches('>')
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A key handed out for one request.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub provider: String,
    pub api_key: String,
    /// Index of the key in the provider's configured list.
    pub index: usize,
}

struct KeyManagerState {
    /// provider → ordered key list.
    provider_keys: HashMap<String, Vec<String>>,
    /// provider → next index to try.
    current_index: HashMap<String, usize>,
    /// `"provider/fingerprint"` → expiry epoch seconds.
    quarantined: HashMap<String, f64>,
}

impl KeyManagerState {
    fn reap_expired(&mut self) {
        let now = now_epoch();
        let expired: Vec<String> = self
            .quarantined
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            for key in &expired {
                self.quarantined.remove(key);
            }
            info!("Unquarantined {} expired key(s): {:?}", expired.len(), expired);
        }
    }

    fn is_quarantined(&self, provider: &str, key: &str) -> bool {
        let map_key = format!("{}/{}", provider, key_fingerprint(key));
        match self.quarantined.get(&map_key) {
            Some(expiry) => *expiry > now_epoch(),
            None => false,
        }
    }
}

/// Round-robin key manager with time-boxed quarantine, shared between cycle
/// tasks behind an internal mutex.
pub struct KeyManager {
    state: Mutex<KeyManagerState>,
    state_path: PathBuf,
}

impl KeyManager {
    /// Build a manager from the configured `provider → [keys]` map, loading
    /// any persisted quarantine state from `state_path`.
    pub fn new(provider_api_keys: HashMap<String, Vec<String>>, state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let current_index = provider_api_keys
            .keys()
            .map(|p| (p.clone(), 0usize))
            .collect();
        let quarantined = load_quarantine_state(&state_path);
        let mut state = KeyManagerState {
            provider_keys: provider_api_keys,
            current_index,
            quarantined,
        };
        state.reap_expired();
        KeyManager {
            state: Mutex::new(state),
            state_path,
        }
    }

    /// Next non-quarantined key for `provider`, rotating the index past it.
    ///
    /// Returns `None` when the provider has no keys configured (local
    /// providers are keyless and never reach here) or when every key is
    /// quarantined — the provider is depleted.
    pub async fn get_active_key_config(&self, provider: &str) -> Option<ActiveKey> {
        let mut state = self.state.lock().await;
        state.reap_expired();
        let keys = match state.provider_keys.get(provider) {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => {
                debug!("No API keys configured for provider '{}'", provider);
                return None;
            }
        };
        let num_keys = keys.len();
        let start = state.current_index.get(provider).copied().unwrap_or(0) % num_keys;
        for i in 0..num_keys {
            let idx = (start + i) % num_keys;
            let key_value = &keys[idx];
            if !state.is_quarantined(provider, key_value) {
                state
                    .current_index
                    .insert(provider.to_string(), (idx + 1) % num_keys);
                info!("Providing active key (index {}) for provider '{}'", idx, provider);
                return Some(ActiveKey {
                    provider: provider.to_string(),
                    api_key: key_value.clone(),
                    index: idx,
                });
            }
            warn!(
                "Key (index {}) for provider '{}' is quarantined, trying next",
                idx, provider
            );
        }
        error!("All {} key(s) for provider '{}' are quarantined", num_keys, provider);
        None
    }

    /// Quarantine `key` for `provider` for `duration_seconds` (defaulted by
    /// [`quarantine_key_default`](KeyManager::quarantine_key_default)).
    pub async fn quarantine_key(&self, provider: &str, key: &str, duration_seconds: u64) {
        let cleaned = clean_key(key);
        if cleaned.is_empty() {
            debug!("Ignoring quarantine request with empty key for '{}'", provider);
            return;
        }
        let fingerprint = key_fingerprint(cleaned);
        let expiry = now_epoch() + duration_seconds as f64;
        let mut state = self.state.lock().await;
        state
            .quarantined
            .insert(format!("{}/{}", provider, fingerprint), expiry);
        warn!(
            "Quarantined key {} for provider '{}' for {}s",
            fingerprint, provider, duration_seconds
        );
    }

    /// Quarantine with the standard 24 h TTL.
    pub async fn quarantine_key_default(&self, provider: &str, key: &str) {
        self.quarantine_key(provider, key, DEFAULT_QUARANTINE_SECONDS)
            .await;
    }

    /// True when every configured key for `provider` is quarantined (or the
    /// provider has no keys at all).
    pub async fn is_provider_depleted(&self, provider: &str) -> bool {
        let mut state = self.state.lock().await;
        state.reap_expired();
        let keys = match state.provider_keys.get(provider) {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => return true,
        };
        !keys.iter().any(|k| !state.is_quarantined(provider, k))
    }

    /// Number of keys configured for `provider`.
    pub async fn key_count(&self, provider: &str) -> usize {
        let state = self.state.lock().await;
        state.provider_keys.get(provider).map_or(0, |k| k.len())
    }

    /// Persist the quarantine map atomically (write temp file, rename over
    /// the target). Expired entries are reaped first.
    pub async fn save_quarantine_state(&self) -> io::Result<()> {
        let (snapshot, path) = {
            let mut state = self.state.lock().await;
            state.reap_expired();
            (state.quarantined.clone(), self.state_path.clone())
        };
        tokio::task::spawn_blocking(move || write_quarantine_state(&path, &snapshot))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    /// Snapshot of currently quarantined `"provider/fingerprint"` entries.
    pub async fn quarantined_entries(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.reap_expired();
        let mut entries: Vec<String> = state.quarantined.keys().cloned().collect();
        entries.sort();
        entries
    }
}

fn load_quarantine_state(path: &Path) -> HashMap<String, f64> {
    if !path.exists() {
        info!("Quarantine state file not found, starting empty");
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<HashMap<String, f64>>(&raw) {
            Ok(map) => {
                info!("Loaded {} quarantine entries from {}", map.len(), path.display());
                map
            }
            Err(e) => {
                error!("Invalid quarantine state file {}: {}", path.display(), e);
                HashMap::new()
            }
        },
        Err(e) => {
            error!("Error reading quarantine state {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

fn write_quarantine_state(path: &Path, entries: &HashMap<String, f64>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    debug!("Saved quarantine state ({} entries) to {}", entries.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(keys: Vec<&str>) -> KeyManager {
        let mut map = HashMap::new();
        map.insert(
            "openrouter".to_string(),
            keys.into_iter().map(String::from).collect(),
        );
        let dir = std::env::temp_dir().join(format!(
            "agentmesh_km_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        KeyManager::new(map, dir.join("quarantine_state.json"))
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let km = manager_with(vec!["k1", "k2", "k3"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(km.get_active_key_config("openrouter").await.unwrap().api_key);
        }
        seen.sort();
        assert_eq!(seen, vec!["k1", "k2", "k3"]);
    }

    #[tokio::test]
    async fn test_quarantine_skips_key() {
        let km = manager_with(vec!["k1", "k2"]);
        km.quarantine_key_default("openrouter", "k1").await;
        for _ in 0..4 {
            let active = km.get_active_key_config("openrouter").await.unwrap();
            assert_eq!(active.api_key, "k2");
        }
        assert!(!km.is_provider_depleted("openrouter").await);
        km.quarantine_key_default("openrouter", "k2").await;
        assert!(km.is_provider_depleted("openrouter").await);
        assert!(km.get_active_key_config("openrouter").await.is_none());
    }

    #[tokio::test]
    async fn test_quarantine_expiry() {
        let km = manager_with(vec!["k1"]);
        km.quarantine_key("openrouter", "k1", 0).await;
        // TTL of zero expires immediately; the next read must reap it.
        let active = km.get_active_key_config("openrouter").await;
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn test_key_cleaning_matches_fingerprint() {
        let km = manager_with(vec!["  k1> "]);
        km.quarantine_key_default("openrouter", "k1").await;
        assert!(km.is_provider_depleted("openrouter").await);
    }
}
