//! Model and key failover.
//!
//! Invoked by the next-step scheduler when a cycle reports a provider-level
//! error. The handler classifies the failure, quarantines and rotates keys
//! where the key is at fault, then walks the ranked list of alternate
//! `(provider, model)` pairs (parameter count descending, performance score
//! descending, id ascending), excluding everything this agent already tried
//! in the current failure episode, and switches the agent onto the first
//! candidate whose provider probes healthy.
//!
//! The tried-sets live on the agent ([`FailoverState`](crate::agentmesh::agent::FailoverState))
//! and are cleared by the cycle engine after the next successful cycle.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::agentmesh::agent::Agent;
use crate::agentmesh::config::ModelTier;
use crate::agentmesh::key_manager::{key_fingerprint, KeyManager};
use crate::agentmesh::model_registry::{compare_models, ModelInfo, ModelRegistry};
use crate::agentmesh::performance::PerformanceTracker;
use crate::agentmesh::provider::{ProviderAdapter, ProviderError, ProviderErrorKind};

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverDecision {
    /// The agent's binding was switched; schedule a fresh cycle.
    SwitchModel { provider: String, model_id: String },
    /// Nothing viable remains; park the agent in error with this reason.
    Exhausted { reason: String },
}

pub struct FailoverHandler {
    key_manager: Arc<KeyManager>,
    tracker: Arc<PerformanceTracker>,
    registry: Arc<ModelRegistry>,
}

impl FailoverHandler {
    pub fn new(
        key_manager: Arc<KeyManager>,
        tracker: Arc<PerformanceTracker>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        FailoverHandler {
            key_manager,
            tracker,
            registry,
        }
    }

    /// Handle one failed cycle for `agent`.
    ///
    /// Mutates the agent's failover state and, on success, its
    /// provider/model binding. Scheduling the follow-up cycle is the
    /// caller's job.
    pub async fn handle_cycle_failure(
        &self,
        agent: &mut Agent,
        error: &ProviderError,
        providers: &HashMap<String, Arc<dyn ProviderAdapter>>,
    ) -> FailoverDecision {
        let failed_provider = agent.provider_name.clone();
        let failed_model = agent.model_id.clone();
        let provider_is_local = providers
            .get(&failed_provider)
            .map_or(false, |p| p.is_local());

        warn!(
            "Failover for '{}' on {}/{}: {}",
            agent.agent_id, failed_provider, failed_model, error
        );

        // Record the failing model as tried.
        if provider_is_local {
            agent
                .failover
                .tried_models_per_local_provider
                .entry(failed_provider.clone())
                .or_default()
                .insert(failed_model.clone());
        } else {
            agent
                .failover
                .tried_models_on_current_external_key
                .insert(failed_model.clone());
        }

        // Key-related failures: quarantine the current key and rotate.
        if error.kind == ProviderErrorKind::KeyRelated && !provider_is_local {
            if let Some(key) = agent.current_api_key.take() {
                self.key_manager
                    .quarantine_key_default(&failed_provider, &key)
                    .await;
                agent
                    .failover
                    .tried_external_keys_for_provider
                    .insert(key_fingerprint(&key));
            }
            agent.failover.clear_current_key_models();
            if self.key_manager.is_provider_depleted(&failed_provider).await {
                warn!(
                    "Provider '{}' depleted for '{}'; considering alternates only",
                    failed_provider, agent.agent_id
                );
            }
            // The failing model burned the previous key, not the fresh one,
            // but it stays excluded this episode so we don't bounce straight
            // back onto the combination that failed.
            agent
                .failover
                .tried_models_on_current_external_key
                .insert(failed_model.clone());
        }

        // Enumerate and rank candidates.
        let snapshot = self.registry.available_models().await;
        let mut candidates: Vec<ModelInfo> = Vec::new();
        for model in snapshot.iter() {
            if self.is_excluded(agent, model) {
                continue;
            }
            let mut candidate = model.clone();
            candidate.score = Some(
                self.tracker
                    .score_for(&candidate.provider, &candidate.id)
                    .await,
            );
            candidates.push(candidate);
        }

        candidates.sort_by(|a, b| {
            if self.registry.tier() == ModelTier::Local {
                // Local first under the LOCAL tier, then the comprehensive order.
                b.is_local
                    .cmp(&a.is_local)
                    .then_with(|| compare_models(a, b))
            } else {
                compare_models(a, b)
            }
        });

        for candidate in candidates {
            let adapter = match providers.get(&candidate.provider) {
                Some(adapter) => adapter,
                None => continue,
            };
            if !candidate.is_local
                && self.key_manager.is_provider_depleted(&candidate.provider).await
            {
                continue;
            }
            if !adapter.probe().await {
                warn!("Provider '{}' failed its health probe", candidate.provider);
                continue;
            }

            if candidate.is_local {
                agent
                    .failover
                    .tried_models_per_local_provider
                    .entry(candidate.provider.clone())
                    .or_default()
                    .insert(candidate.id.clone());
            } else {
                agent
                    .failover
                    .tried_models_on_current_external_key
                    .insert(candidate.id.clone());
            }
            info!(
                "Failover for '{}': {}/{} -> {}/{}",
                agent.agent_id, failed_provider, failed_model, candidate.provider, candidate.id
            );
            agent.provider_name = candidate.provider.clone();
            agent.model_id = candidate.id.clone();
            return FailoverDecision::SwitchModel {
                provider: candidate.provider,
                model_id: candidate.id,
            };
        }

        FailoverDecision::Exhausted {
            reason: format!(
                "No alternate model available after failure of {}/{} ({})",
                failed_provider, failed_model, error.message
            ),
        }
    }

    fn is_excluded(&self, agent: &Agent, model: &ModelInfo) -> bool {
        if model.is_local {
            agent
                .failover
                .tried_models_per_local_provider
                .get(&model.provider)
                .map_or(false, |tried| tried.contains(&model.id))
        } else {
            agent
                .failover
                .tried_models_on_current_external_key
                .contains(&model.id)
        }
    }
}
