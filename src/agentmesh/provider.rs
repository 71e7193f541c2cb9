//! Provider-agnostic LLM streaming contract.
//!
//! The runtime never speaks a vendor wire protocol directly. Instead every
//! provider is wrapped behind [`ProviderAdapter`], whose single job is to turn
//! a chat request into an async stream of typed [`StreamEvent`]s. The cycle
//! engine consumes those events as opaque tags — the adapter is responsible
//! for mapping its native streaming/tool-call semantics into this shape.
//!
//! # Event stream
//!
//! ```text
//! stream_completion(request)
//!   ├─ ResponseChunk      incremental assistant text
//!   ├─ AgentThought       a <think>…</think> block extracted from the stream
//!   ├─ ToolRequests       parsed tool calls (plus the raw assistant text)
//!   ├─ MalformedToolCall  tool-call-looking text that failed to parse
//!   ├─ AgentStateChangeRequested  <request_state state='…'/>
//!   ├─ WorkflowExecuted   provider-side workflow result (project creation)
//!   ├─ FinalResponse      the completed assistant turn
//!   └─ Error              provider-level failure, classified for failover
//! ```
//!
//! A well-behaved adapter terminates the stream after emitting one of the
//! terminal events (`ToolRequests`, `FinalResponse`, `WorkflowExecuted`,
//! `Error`).

use std::error::Error;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::agentmesh::agent::{Message, ToolCallRecord};

/// Classification of a provider failure, consumed by the failover handler to
/// decide between key rotation, model switching, and plain retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Authentication, rate-limit or quota problem tied to the current key.
    /// Quarantine the key and rotate.
    KeyRelated,
    /// The endpoint itself is unreachable or consistently erroring.
    ProviderDown,
    /// This specific model rejected the request (bad request, refusal, 404).
    /// Switch models without touching the key.
    ModelUnusable,
    /// Anything else; worth a plain retry before escalating.
    Transient,
}

/// Error surfaced by a [`ProviderAdapter`].
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            message: message.into(),
        }
    }

    pub fn key_related(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::KeyRelated, message)
    }

    pub fn provider_down(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ProviderDown, message)
    }

    pub fn model_unusable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ModelUnusable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error ({:?}): {}", self.kind, self.message)
    }
}

impl Error for ProviderError {}

/// Result of a provider-side workflow execution (currently only project
/// creation, triggered when the admin emits a plan block).
#[derive(Debug, Clone, Default)]
pub struct WorkflowResult {
    /// Human-readable name of the workflow that ran.
    pub workflow_name: String,
    /// New workflow state for the originating agent, if the workflow changes it.
    pub next_state: Option<String>,
    /// Message to surface to the UI.
    pub ui_message: Option<String>,
    /// Agent ids that should get a cycle scheduled after this workflow.
    pub agents_to_schedule: Vec<String>,
    /// Project title extracted by the workflow, when applicable.
    pub project_title: Option<String>,
    /// Plan body extracted by the workflow, when applicable.
    pub plan_description: Option<String>,
}

/// One event from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental assistant text delta.
    ResponseChunk { content: String },
    /// A reasoning block the adapter extracted from the stream. Persisted and
    /// optionally saved to the knowledge store; never shown as final output.
    AgentThought { content: String },
    /// Parsed tool calls. `raw_text` is the full assistant text the calls
    /// were extracted from (it may additionally contain a state-change
    /// request, which the cycle engine handles after the tools).
    ToolRequests {
        calls: Vec<ToolCallRecord>,
        raw_text: String,
    },
    /// Tool-call-shaped text that could not be parsed. The cycle engine will
    /// attempt XML recovery before falling back to corrective feedback.
    MalformedToolCall {
        tool_name: String,
        error_message: String,
        raw_text: String,
    },
    /// The agent asked for a workflow state transition.
    AgentStateChangeRequested { state: String },
    /// A provider-side workflow ran to completion.
    WorkflowExecuted { result: WorkflowResult },
    /// The assistant turn is complete.
    FinalResponse { content: String },
    /// PM in startup produced a `<think>` block but no `<task_list>`.
    PmStartupMissingTaskList,
    /// The adapter detected completion-flavored wording from a PM.
    PmCompletionDetection { content: String },
    /// Provider-level failure; terminal.
    Error { error: ProviderError },
}

/// Boxed stream of completion events, `Send` so cycles can run on any worker.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Chat request handed to an adapter.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// API key selected by the key manager, absent for keyless local
    /// providers.
    pub api_key: Option<String>,
}

/// Drive a completion to its end and return the final assistant text.
///
/// Used for internal LLM calls (guardian verdicts, summarization) that do
/// not need the event-by-event treatment of a full agent cycle. Tool
/// requests and state changes from the stream are ignored; an `Error` event
/// or a failed start surfaces as `Err`.
pub async fn collect_completion_text(
    adapter: &dyn ProviderAdapter,
    request: CompletionRequest,
) -> Result<String, ProviderError> {
    use futures_util::StreamExt;

    let mut stream = adapter.stream_completion(request).await?;
    let mut buffer = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::ResponseChunk { content } => buffer.push_str(&content),
            StreamEvent::FinalResponse { content } => {
                if !content.is_empty() {
                    return Ok(content);
                }
            }
            StreamEvent::Error { error } => return Err(error),
            _ => {}
        }
    }
    Ok(buffer)
}

/// Trait-driven abstraction over one reachable LLM endpoint.
///
/// Implementations **must** be `Send + Sync` so they can be shared between
/// cycle tasks. Adapters report their health through [`probe`](ProviderAdapter::probe)
/// which the failover handler calls before switching an agent onto them.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Name this adapter is registered under (e.g. `"ollama-local-11434"`).
    fn provider_name(&self) -> &str;

    /// Whether the endpoint is loopback/LAN-local. Local providers are
    /// keyless and preferred when the model tier is `Local`.
    fn is_local(&self) -> bool;

    /// Start a streaming completion. Returns the event stream, or a
    /// classified error when the request could not even be started.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<EventStream, ProviderError>;

    /// Cheap reachability probe used by the failover handler. The default
    /// implementation reports healthy; HTTP-backed adapters override this
    /// with a real request.
    async fn probe(&self) -> bool {
        true
    }
}
