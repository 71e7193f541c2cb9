//! Tool schemas, execution contract, and the dispatcher.
//!
//! Every tool declares a [`ToolSchema`] (name, description, authorization
//! level, typed parameters) and implements [`Tool::execute`], returning a
//! uniform [`ToolResult`] of `{status, message, data}`. Tool-specific extras
//! live inside `data`; the engine itself only ever inspects `status`,
//! `message`, and a handful of well-known `data` fields (`action`,
//! `assignee`, `task_uuid`).
//!
//! The [`ToolExecutor`] owns the registry, enforces authorization by agent
//! kind, keeps per-tool success/failure counters for periodic reporting, and
//! answers `tool_information` queries (list_tools / get_info) directly from
//! the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::agentmesh::agent::AgentKind;

/// Parameter type tag surfaced in schemas and corrective examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
        }
    }

    /// Placeholder value used when generating corrective XML examples.
    fn example_value(&self, name: &str) -> String {
        match self {
            ParamType::String => format!("example_{}", name),
            ParamType::Integer => "1".to_string(),
            ParamType::Float => "1.0".to_string(),
            ParamType::Boolean => "true".to_string(),
        }
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub description: &'static str,
}

/// Minimum agent kind allowed to invoke a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    Worker,
    Pm,
    Admin,
}

impl AuthLevel {
    /// Whether an agent of `kind` clears this level. The guardian only runs
    /// internal reviews and never calls tools.
    pub fn permits(&self, kind: AgentKind) -> bool {
        let rank = match kind {
            AgentKind::Worker => AuthLevel::Worker,
            AgentKind::Pm => AuthLevel::Pm,
            AgentKind::Admin => AuthLevel::Admin,
            AgentKind::Guardian => return false,
        };
        rank >= *self
    }
}

/// Declared shape of one tool.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    /// One-line summary used in list_tools output.
    pub summary: &'static str,
    pub auth_level: AuthLevel,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    /// Corrective XML usage example for this tool, shown to agents after a
    /// malformed call.
    pub fn usage_example(&self) -> String {
        let mut parts = vec![format!("<{}>", self.name)];
        for param in self.parameters.iter().take(3) {
            parts.push(format!(
                "  <{}>{}</{}>",
                param.name,
                param.param_type.example_value(param.name),
                param.name
            ));
        }
        parts.push(format!("</{}>", self.name));
        parts.join("\n")
    }

    /// Multi-line usage description: summary, parameters, and the example.
    pub fn detailed_usage(&self) -> String {
        let mut out = format!("{} — {}\nParameters:\n", self.name, self.description);
        if self.parameters.is_empty() {
            out.push_str("  (none)\n");
        }
        for param in &self.parameters {
            out.push_str(&format!(
                "  - {} ({}{}): {}\n",
                param.name,
                param.param_type.as_str(),
                if param.required { ", required" } else { "" },
                param.description
            ));
        }
        out.push_str("Example:\n");
        out.push_str(&self.usage_example());
        out
    }
}

/// Execution status of a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
    /// The tool validated its arguments but the real work must be performed
    /// by the interaction handler (team management).
    SuccessSignalToHandler,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::SuccessSignalToHandler => "success_signal_to_handler",
        }
    }
}

/// Uniform result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub message: String,
    /// Tool-specific payload. For signal results this holds
    /// `action_to_perform` and `action_params`.
    pub data: Value,
}

impl ToolResult {
    pub fn success(message: impl Into<String>) -> Self {
        ToolResult {
            status: ToolStatus::Success,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn success_with(message: impl Into<String>, data: Value) -> Self {
        ToolResult {
            status: ToolStatus::Success,
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult {
            status: ToolStatus::Error,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// A handler signal: the interaction handler performs `action` with
    /// `params` and substitutes its own result.
    pub fn signal(action: impl Into<String>, params: Value, message: impl Into<String>) -> Self {
        ToolResult {
            status: ToolStatus::SuccessSignalToHandler,
            message: message.into(),
            data: json!({
                "action_to_perform": action.into(),
                "action_params": params,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != ToolStatus::Error
    }

    /// Serialize to the wire shape recorded in `role=tool` messages.
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.status.as_str(),
            "message": self.message,
            "data": self.data,
        })
    }
}

/// Context threaded into every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub agent_kind: AgentKind,
    pub sandbox_path: PathBuf,
    pub project: Option<String>,
    pub session: Option<String>,
}

/// One registered tool implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Execute with parsed string arguments. Implementations return an error
    /// `ToolResult` for bad input rather than panicking; a returned `Err` is
    /// converted into an error result by the executor.
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Default)]
struct ToolStats {
    success_count: u64,
    failure_count: u64,
}

/// Registry plus dispatcher for all tools.
pub struct ToolExecutor {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl ToolExecutor {
    pub fn new() -> Self {
        ToolExecutor {
            tools: HashMap::new(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.insert(name, tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        name == "tool_information" || self.tools.contains_key(name)
    }

    /// Schemas of every registered tool plus the built-in
    /// `tool_information`, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools.values().map(|t| t.schema()).collect();
        schemas.push(Self::tool_information_schema());
        schemas.sort_by(|a, b| a.name.cmp(b.name));
        schemas
    }

    /// Detailed usage text for one tool (used in corrective feedback).
    pub fn detailed_usage(&self, name: &str) -> Option<String> {
        if name == "tool_information" {
            return Some(Self::tool_information_schema().detailed_usage());
        }
        self.tools.get(name).map(|t| t.schema().detailed_usage())
    }

    fn tool_information_schema() -> ToolSchema {
        ToolSchema {
            name: "tool_information",
            description: "Discover available tools and how to call them.",
            summary: "List tools or get detailed usage for one tool.",
            auth_level: AuthLevel::Worker,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "'list_tools' or 'get_info'",
                },
                ToolParameter {
                    name: "tool_name",
                    param_type: ParamType::String,
                    required: false,
                    description: "Tool to describe (for get_info)",
                },
                ToolParameter {
                    name: "sub_action",
                    param_type: ParamType::String,
                    required: false,
                    description: "Specific tool action to describe (for get_info)",
                },
            ],
        }
    }

    fn execute_tool_information(&self, args: &HashMap<String, String>) -> ToolResult {
        match args.get("action").map(String::as_str) {
            Some("list_tools") => {
                let listing: Vec<Value> = self
                    .schemas()
                    .iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "summary": s.summary,
                        })
                    })
                    .collect();
                ToolResult::success_with(
                    format!("{} tool(s) available.", listing.len()),
                    json!({ "tools": listing }),
                )
            }
            Some("get_info") => match args.get("tool_name") {
                Some(tool_name) => match self.detailed_usage(tool_name) {
                    Some(usage) => {
                        // A sub_action narrows the request to one action of the
                        // tool; echo it so callers can tell which usage lookup
                        // this was.
                        let sub_action = args.get("sub_action").filter(|s| !s.is_empty());
                        let message = match sub_action {
                            Some(sub_action) => {
                                format!("Usage for '{}' ({}).", tool_name, sub_action)
                            }
                            None => format!("Usage for '{}'.", tool_name),
                        };
                        ToolResult::success_with(
                            message,
                            json!({
                                "tool_name": tool_name,
                                "sub_action": sub_action,
                                "usage": usage,
                            }),
                        )
                    }
                    None => ToolResult::error(format!("Unknown tool '{}'.", tool_name)),
                },
                None => ToolResult::error("get_info requires a tool_name parameter."),
            },
            Some(other) => ToolResult::error(format!(
                "Unknown tool_information action '{}'. Use 'list_tools' or 'get_info'.",
                other
            )),
            None => ToolResult::error("tool_information requires an action parameter."),
        }
    }

    /// Dispatch one tool call.
    ///
    /// Unknown tools, authorization failures and implementation errors all
    /// come back as error results — nothing raises across this boundary.
    pub async fn execute_tool(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: &HashMap<String, String>,
    ) -> ToolResult {
        let result = if name == "tool_information" {
            self.execute_tool_information(args)
        } else {
            match self.tools.get(name) {
                None => ToolResult::error(format!("Tool '{}' is not registered.", name)),
                Some(tool) => {
                    let schema = tool.schema();
                    if !schema.auth_level.permits(ctx.agent_kind) {
                        ToolResult::error(format!(
                            "Agent '{}' ({}) is not authorized to use '{}'.",
                            ctx.agent_id, ctx.agent_kind, name
                        ))
                    } else {
                        match tool.execute(ctx, args).await {
                            Ok(result) => result,
                            Err(e) => {
                                error!("Tool '{}' raised: {}", name, e);
                                ToolResult::error(format!("Tool execution error: {}", e))
                            }
                        }
                    }
                }
            }
        };

        let mut stats = self.stats.lock().await;
        let entry = stats.entry(name.to_string()).or_default();
        if result.is_success() {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        result
    }

    /// One log line of per-tool counters; called periodically by the cycle
    /// engine.
    pub async fn report_stats(&self) {
        let stats = self.stats.lock().await;
        if stats.is_empty() {
            return;
        }
        let mut names: Vec<&String> = stats.keys().collect();
        names.sort();
        for name in names {
            let s = &stats[name];
            info!(
                "tool stats: {} ok={} failed={}",
                name, s.success_count, s.failure_count
            );
        }
    }

    /// Total executions recorded so far.
    pub async fn total_executions(&self) -> u64 {
        let stats = self.stats.lock().await;
        stats
            .values()
            .map(|s| s.success_count + s.failure_count)
            .sum()
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo",
                description: "Echoes its input back.",
                summary: "Echo input.",
                auth_level: AuthLevel::Pm,
                parameters: vec![ToolParameter {
                    name: "text",
                    param_type: ParamType::String,
                    required: true,
                    description: "Text to echo",
                }],
            }
        }

        async fn execute(
            &self,
            _ctx: &ToolContext,
            args: &HashMap<String, String>,
        ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
            Ok(ToolResult::success(args.get("text").cloned().unwrap_or_default()))
        }
    }

    fn ctx(kind: AgentKind) -> ToolContext {
        ToolContext {
            agent_id: "a1".to_string(),
            agent_kind: kind,
            sandbox_path: PathBuf::from("/tmp"),
            project: None,
            session: None,
        }
    }

    #[tokio::test]
    async fn test_auth_level_enforced() {
        let mut executor = ToolExecutor::new();
        executor.register(Arc::new(EchoTool));
        let mut args = HashMap::new();
        args.insert("text".to_string(), "hi".to_string());

        let denied = executor.execute_tool(&ctx(AgentKind::Worker), "echo", &args).await;
        assert_eq!(denied.status, ToolStatus::Error);

        let allowed = executor.execute_tool(&ctx(AgentKind::Admin), "echo", &args).await;
        assert_eq!(allowed.status, ToolStatus::Success);
        assert_eq!(allowed.message, "hi");
    }

    #[tokio::test]
    async fn test_tool_information_list_and_info() {
        let mut executor = ToolExecutor::new();
        executor.register(Arc::new(EchoTool));

        let mut args = HashMap::new();
        args.insert("action".to_string(), "list_tools".to_string());
        let listing = executor
            .execute_tool(&ctx(AgentKind::Worker), "tool_information", &args)
            .await;
        assert!(listing.is_success());
        let tools = listing.data["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "echo"));

        args.insert("action".to_string(), "get_info".to_string());
        args.insert("tool_name".to_string(), "echo".to_string());
        let info = executor
            .execute_tool(&ctx(AgentKind::Worker), "tool_information", &args)
            .await;
        assert!(info.is_success());
        assert!(info.data["usage"].as_str().unwrap().contains("<echo>"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let executor = ToolExecutor::new();
        let result = executor
            .execute_tool(&ctx(AgentKind::Admin), "nope", &HashMap::new())
            .await;
        assert_eq!(result.status, ToolStatus::Error);
    }
}
