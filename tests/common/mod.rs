//! Shared test fixtures: a scripted provider adapter and a collecting UI sink.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use agentmesh::event::{UiEvent, UiSink};
use agentmesh::provider::{
    CompletionRequest, EventStream, ProviderAdapter, ProviderError, StreamEvent,
};

/// Provider adapter that replays scripted event sequences in order.
///
/// Each call to `stream_completion` pops the next script; when the queue is
/// empty it answers with a benign `FinalResponse("<OK/>")`, which also
/// satisfies trailing guardian review calls.
pub struct ScriptedProvider {
    name: String,
    local: bool,
    delay: Option<Duration>,
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, local: bool) -> Self {
        ScriptedProvider {
            name: name.to_string(),
            local,
            delay: None,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().await.push_back(events);
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<EventStream, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().await.push(request);
        let events = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| {
                vec![StreamEvent::FinalResponse {
                    content: "<OK/>".to_string(),
                }]
            });
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

/// UI sink that records every event for later assertions.
pub struct CollectingSink {
    pub events: Mutex<Vec<UiEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn type_tags(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(|e| e.type_tag()).collect()
    }

    pub async fn has_notification_containing(&self, needle: &str) -> bool {
        self.events.lock().await.iter().any(|e| match e {
            UiEvent::SystemNotification { content, .. } => content.contains(needle),
            _ => false,
        })
    }
}

#[async_trait]
impl UiSink for CollectingSink {
    async fn send(&self, event: &UiEvent) -> bool {
        self.events.lock().await.push(event.clone());
        true
    }
}

/// Fresh temp directory for one test.
pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "agentmesh_it_{}_{}_{}",
        tag,
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Wait until no cycle is in flight for `agent_id` (with timeout).
pub async fn wait_for_idle(manager: &Arc<agentmesh::AgentManager>, agent_id: &str) {
    for _ in 0..200 {
        if !manager.cycle_in_flight(agent_id).await {
            // One extra tick lets freshly spawned follow-up work settle.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !manager.cycle_in_flight(agent_id).await {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent '{}' never went idle", agent_id);
}
