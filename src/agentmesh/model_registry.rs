//! Model discovery and ranking.
//!
//! The registry discovers models from local OpenAI-compatible endpoints
//! (Ollama, LM Studio, vLLM) by probing well-known loopback ports, and
//! accepts remote provider catalogs injected through configuration. Each
//! discovered model carries a parameter count when the provider reports one
//! (Ollama's `parameter_size` string, a remote schema's `n_parameters`, or,
//! as a last resort, a size token embedded in the model id like `-7b-`).
//!
//! Readers always see an immutable snapshot: discovery swaps the whole model
//! list atomically, so a cycle that is mid-failover never observes a
//! half-updated registry.
//!
//! # Comprehensive ranking
//!
//! [`compare_models`] defines the total order used by the failover handler:
//! parameter count descending (missing counts as smallest), performance score
//! descending (missing as `0.0`), then id ascending as the tie-breaker.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::agentmesh::config::ModelTier;

/// One discovered or configured model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Registered provider name (e.g. `"ollama-local-11434"`, `"openrouter"`).
    pub provider: String,
    /// Model id as the provider reports it.
    pub id: String,
    /// Parameter count, when known.
    pub num_parameters: Option<u64>,
    /// Performance score snapshot, filled in at ranking time.
    pub score: Option<f64>,
    /// Whether the provider is a local endpoint.
    pub is_local: bool,
}

/// Parse provider-reported parameter-size strings like `"7B"`, `"3.5M"`,
/// `"0.5B"`, `"1.2K"` into an absolute count.
pub fn parse_parameter_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (number_part, multiplier) = match trimmed.chars().last()? {
        'b' | 'B' => (&trimmed[..trimmed.len() - 1], 1_000_000_000f64),
        'm' | 'M' => (&trimmed[..trimmed.len() - 1], 1_000_000f64),
        'k' | 'K' => (&trimmed[..trimmed.len() - 1], 1_000f64),
        _ => (trimmed, 1f64),
    };
    let value: f64 = number_part.trim().parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

lazy_static! {
    static ref ID_SIZE_INNER: Regex = Regex::new(r"[-_](\d+(?:\.\d+)?)[bB][-_]").unwrap();
    static ref ID_SIZE_END: Regex = Regex::new(r"[-_](\d+(?:\.\d+)?)[bB]$").unwrap();
}

/// Best-effort parameter count from a size token embedded in the model id
/// (`mistral-7b-instruct` → 7e9). Returns `None` when no token is present.
pub fn extract_size_from_id(model_id: &str) -> Option<u64> {
    let captures = ID_SIZE_INNER
        .captures(model_id)
        .or_else(|| ID_SIZE_END.captures(model_id))?;
    let billions: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some((billions * 1_000_000_000f64).round() as u64)
}

/// Total order over models: parameters desc, score desc, id asc.
pub fn compare_models(a: &ModelInfo, b: &ModelInfo) -> Ordering {
    let params_a = a.num_parameters.unwrap_or(0);
    let params_b = b.num_parameters.unwrap_or(0);
    params_b
        .cmp(&params_a)
        .then_with(|| {
            let score_a = a.score.unwrap_or(0.0);
            let score_b = b.score.unwrap_or(0.0);
            score_b.partial_cmp(&score_a).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Whether `model` passes the given tier filter.
pub fn passes_tier(model: &ModelInfo, tier: ModelTier) -> bool {
    match tier {
        ModelTier::Local => model.is_local,
        ModelTier::Free => model.is_local || model.id.contains(":free"),
        ModelTier::All => true,
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTagEntry>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OllamaShowResponse {
    #[serde(default)]
    details: OllamaShowDetails,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaShowDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelsResponse {
    #[serde(default)]
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    id: String,
    #[serde(default)]
    n_parameters: Option<u64>,
}

/// Endpoint kind detected during a local probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Ollama,
    OpenAiCompatible,
}

/// Model registry: discovery plus the current snapshot.
pub struct ModelRegistry {
    http: reqwest::Client,
    tier: ModelTier,
    scan_ports: Vec<u16>,
    scan_enabled: bool,
    /// Remote catalogs injected by configuration: provider → models.
    remote_catalogs: RwLock<HashMap<String, Vec<ModelInfo>>>,
    /// Immutable snapshot swapped wholesale on discovery.
    snapshot: RwLock<Arc<Vec<ModelInfo>>>,
}

impl ModelRegistry {
    pub fn new(tier: ModelTier, scan_ports: Vec<u16>, scan_enabled: bool, scan_timeout: f64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(scan_timeout.max(0.1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        ModelRegistry {
            http,
            tier,
            scan_ports,
            scan_enabled,
            remote_catalogs: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register or replace a remote provider's catalog. Takes effect on the
    /// next [`discover`](ModelRegistry::discover).
    pub async fn set_remote_catalog(&self, provider: &str, models: Vec<(String, Option<u64>)>) {
        let infos = models
            .into_iter()
            .map(|(id, n_parameters)| {
                let num_parameters = n_parameters.or_else(|| extract_size_from_id(&id));
                ModelInfo {
                    provider: provider.to_string(),
                    id,
                    num_parameters,
                    score: None,
                    is_local: false,
                }
            })
            .collect();
        self.remote_catalogs
            .write()
            .await
            .insert(provider.to_string(), infos);
    }

    /// Run a discovery pass: probe local endpoints, merge remote catalogs,
    /// apply the tier filter, and swap the snapshot.
    pub async fn discover(&self) {
        let mut models = Vec::new();

        for port in self.local_probe_ports() {
            let base = format!("http://127.0.0.1:{}", port);
            if let Some((kind, discovered)) = self.probe_endpoint(&base, port).await {
                debug!("Local endpoint {} answered as {:?}", base, kind);
                models.extend(discovered);
            }
        }

        {
            let catalogs = self.remote_catalogs.read().await;
            for provider_models in catalogs.values() {
                models.extend(provider_models.iter().cloned());
            }
        }

        models.retain(|m| passes_tier(m, self.tier));
        info!(
            "Model discovery complete: {} model(s) pass tier {:?}",
            models.len(),
            self.tier
        );
        *self.snapshot.write().await = Arc::new(models);
    }

    fn local_probe_ports(&self) -> Vec<u16> {
        if self.scan_enabled {
            self.scan_ports.clone()
        } else {
            // Loopback defaults only: Ollama, LM Studio, vLLM.
            vec![11434, 1234, 8000]
        }
    }

    async fn probe_endpoint(&self, base: &str, port: u16) -> Option<(EndpointKind, Vec<ModelInfo>)> {
        // Ollama first: its /api/tags is unambiguous.
        if let Ok(resp) = self.http.get(format!("{}/api/tags", base)).send().await {
            if resp.status().is_success() {
                if let Ok(tags) = resp.json::<OllamaTagsResponse>().await {
                    let provider = format!("ollama-local-{}", port);
                    let mut models = Vec::new();
                    for entry in tags.models {
                        let num_parameters = self
                            .fetch_ollama_parameter_size(base, &entry.name)
                            .await
                            .or_else(|| extract_size_from_id(&entry.name));
                        models.push(ModelInfo {
                            provider: provider.clone(),
                            id: entry.name,
                            num_parameters,
                            score: None,
                            is_local: true,
                        });
                    }
                    return Some((EndpointKind::Ollama, models));
                }
            }
        }

        // OpenAI-compatible fallback.
        match self.http.get(format!("{}/v1/models", base)).send().await {
            Ok(resp) if resp.status().is_success() => {
                let provider = format!("openai-local-{}", port);
                match resp.json::<OpenAiModelsResponse>().await {
                    Ok(listing) => {
                        let models = listing
                            .data
                            .into_iter()
                            .map(|entry| {
                                let num_parameters =
                                    entry.n_parameters.or_else(|| extract_size_from_id(&entry.id));
                                ModelInfo {
                                    provider: provider.clone(),
                                    id: entry.id,
                                    num_parameters,
                                    score: None,
                                    is_local: true,
                                }
                            })
                            .collect();
                        Some((EndpointKind::OpenAiCompatible, models))
                    }
                    Err(e) => {
                        warn!("Endpoint {} returned unparseable model list: {}", base, e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    async fn fetch_ollama_parameter_size(&self, base: &str, model: &str) -> Option<u64> {
        let resp = self
            .http
            .post(format!("{}/api/show", base))
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let show: OllamaShowResponse = resp.json().await.ok()?;
        show.details
            .parameter_size
            .as_deref()
            .and_then(parse_parameter_size)
    }

    /// Current immutable snapshot.
    pub async fn available_models(&self) -> Arc<Vec<ModelInfo>> {
        self.snapshot.read().await.clone()
    }

    /// Replace the snapshot directly. Used by tests and by deployments that
    /// manage their own discovery cadence.
    pub async fn set_models(&self, models: Vec<ModelInfo>) {
        let filtered: Vec<ModelInfo> = models
            .into_iter()
            .filter(|m| passes_tier(m, self.tier))
            .collect();
        *self.snapshot.write().await = Arc::new(filtered);
    }

    pub fn tier(&self) -> ModelTier {
        self.tier
    }
}
