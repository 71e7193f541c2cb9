//! Per-model performance tracking.
//!
//! Records success/failure counts and success latency for every
//! `(provider, model)` pair seen by the cycle engine, derives a 0..1 score
//! from them, and persists the counters as JSON (atomically, write-temp-then-
//! rename). The failover handler and the model registry both consult the
//! score through [`PerformanceTracker::score_for`], keyed uniformly on
//! `(provider, model_id)`.
//!
//! # Scoring
//!
//! ```text
//! score = success_rate * 0.8 + (1 - latency_penalty) * 0.2
//! latency_penalty = min(0.3, avg_ms / 100_000)   when avg_ms > 10_000
//!                 = min(0.1, avg_ms /  50_000)   when avg_ms >  3_000
//!                 = 0                            otherwise
//! ```
//!
//! Models with fewer than `min_calls_threshold` calls are scaled down
//! linearly so sparse data never outranks an established model. A model with
//! zero calls scores −1.0.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Raw counters for one `(provider, model)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Cumulative duration of *successful* calls only.
    #[serde(default)]
    pub total_duration_ms: f64,
    #[serde(default)]
    pub call_count: u64,
}

impl ModelMetrics {
    /// Ranking score; see the module docs for the formula.
    pub fn score(&self, min_calls_threshold: u64) -> f64 {
        if self.call_count == 0 {
            return -1.0;
        }
        let success_rate = self.success_count as f64 / self.call_count as f64;
        let avg_ms = if self.success_count > 0 {
            self.total_duration_ms / self.success_count as f64
        } else {
            f64::INFINITY
        };
        let latency_penalty = if avg_ms > 10_000.0 {
            (avg_ms / 100_000.0).min(0.3)
        } else if avg_ms > 3_000.0 {
            (avg_ms / 50_000.0).min(0.1)
        } else {
            0.0
        };
        let mut score = success_rate * 0.8 + (1.0 - latency_penalty) * 0.2;
        if self.call_count < min_calls_threshold {
            score *= self.call_count as f64 / min_calls_threshold as f64;
        }
        (score * 10_000.0).round() / 10_000.0
    }
}

/// One entry of [`PerformanceTracker::get_ranked_models`].
#[derive(Debug, Clone)]
pub struct RankedModel {
    pub provider: String,
    pub model_id: String,
    pub score: f64,
    pub metrics: ModelMetrics,
}

/// Thread-safe success/latency tracker, persisted as
/// `provider → model_id → counters` JSON.
pub struct PerformanceTracker {
    metrics: Mutex<HashMap<String, HashMap<String, ModelMetrics>>>,
    metrics_path: PathBuf,
}

impl PerformanceTracker {
    /// Load any persisted metrics from `metrics_path` (missing or corrupt
    /// files start the tracker empty).
    pub fn new(metrics_path: impl Into<PathBuf>) -> Self {
        let metrics_path = metrics_path.into();
        let metrics = load_metrics(&metrics_path);
        PerformanceTracker {
            metrics: Mutex::new(metrics),
            metrics_path,
        }
    }

    /// Record the outcome of one LLM call. `duration_ms` only accumulates
    /// into the latency average when the call succeeded.
    pub async fn record_call(&self, provider: &str, model_id: &str, duration_ms: f64, success: bool) {
        if provider.is_empty() || model_id.is_empty() {
            warn!("record_call with empty provider or model id, ignoring");
            return;
        }
        let mut metrics = self.metrics.lock().await;
        let entry = metrics
            .entry(provider.to_string())
            .or_insert_with(HashMap::new)
            .entry(model_id.to_string())
            .or_insert_with(ModelMetrics::default);
        entry.call_count += 1;
        if success {
            entry.success_count += 1;
            entry.total_duration_ms += duration_ms;
        } else {
            entry.failure_count += 1;
        }
        debug!(
            "Recorded call for {}/{}: success={} duration={:.1}ms (calls={})",
            provider, model_id, success, duration_ms, entry.call_count
        );
    }

    /// Score for one `(provider, model_id)` pair. `0.0` when the pair has
    /// never been seen — callers treat missing data as neutral, not as
    /// disqualifying.
    pub async fn score_for(&self, provider: &str, model_id: &str) -> f64 {
        let metrics = self.metrics.lock().await;
        metrics
            .get(provider)
            .and_then(|models| models.get(model_id))
            .map(|m| m.score(5))
            .unwrap_or(0.0)
    }

    /// Counters for one pair, if recorded.
    pub async fn metrics_for(&self, provider: &str, model_id: &str) -> Option<ModelMetrics> {
        let metrics = self.metrics.lock().await;
        metrics
            .get(provider)
            .and_then(|models| models.get(model_id))
            .cloned()
    }

    /// Models ranked by score descending, optionally restricted to one
    /// provider. `min_calls` is the threshold below which scores are scaled
    /// down.
    pub async fn get_ranked_models(
        &self,
        provider: Option<&str>,
        min_calls: u64,
    ) -> Vec<RankedModel> {
        let metrics = self.metrics.lock().await;
        let mut ranked = Vec::new();
        for (prov, models) in metrics.iter() {
            if let Some(filter) = provider {
                if prov != filter {
                    continue;
                }
            }
            for (model_id, stats) in models {
                ranked.push(RankedModel {
                    provider: prov.clone(),
                    model_id: model_id.clone(),
                    score: stats.score(min_calls),
                    metrics: stats.clone(),
                });
            }
        }
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Persist the counters atomically.
    pub async fn save_metrics(&self) -> io::Result<()> {
        let (snapshot, path) = {
            let metrics = self.metrics.lock().await;
            (metrics.clone(), self.metrics_path.clone())
        };
        tokio::task::spawn_blocking(move || write_metrics(&path, &snapshot))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

fn load_metrics(path: &Path) -> HashMap<String, HashMap<String, ModelMetrics>> {
    if !path.exists() {
        info!("Metrics file not found at {}, starting empty", path.display());
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                error!("Invalid metrics file {}: {}", path.display(), e);
                HashMap::new()
            }
        },
        Err(e) => {
            error!("Error reading metrics file {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

fn write_metrics(
    path: &Path,
    metrics: &HashMap<String, HashMap<String, ModelMetrics>>,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(metrics)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!("Saved performance metrics to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_zero_calls() {
        let m = ModelMetrics::default();
        assert_eq!(m.score(5), -1.0);
    }

    #[test]
    fn test_score_fast_and_reliable() {
        let m = ModelMetrics {
            success_count: 10,
            failure_count: 0,
            total_duration_ms: 10_000.0, // 1s average
            call_count: 10,
        };
        assert!((m.score(5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_latency_penalty_bands() {
        // 20s average: penalty min(0.3, 20000/100000) = 0.2
        let slow = ModelMetrics {
            success_count: 10,
            failure_count: 0,
            total_duration_ms: 200_000.0,
            call_count: 10,
        };
        assert!((slow.score(5) - (0.8 + 0.8 * 0.2)).abs() < 1e-9);

        // 5s average: penalty min(0.1, 5000/50000) = 0.1
        let medium = ModelMetrics {
            success_count: 10,
            failure_count: 0,
            total_duration_ms: 50_000.0,
            call_count: 10,
        };
        assert!((medium.score(5) - (0.8 + 0.9 * 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_score_sparse_scaled_down() {
        let sparse = ModelMetrics {
            success_count: 1,
            failure_count: 0,
            total_duration_ms: 100.0,
            call_count: 1,
        };
        // Full score would be 1.0; scaled by 1/5.
        assert!((sparse.score(5) - 0.2).abs() < 1e-9);
    }
}
