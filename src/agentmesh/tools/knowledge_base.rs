//! Knowledge-base tool: persist distilled findings and search them back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::agentmesh::interaction_log::KnowledgeStore;
use crate::agentmesh::tool_protocol::{
    AuthLevel, ParamType, Tool, ToolContext, ToolParameter, ToolResult, ToolSchema,
};

pub struct KnowledgeBaseTool {
    store: Arc<KnowledgeStore>,
}

impl KnowledgeBaseTool {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        KnowledgeBaseTool { store }
    }
}

#[async_trait]
impl Tool for KnowledgeBaseTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "knowledge_base",
            description: "Save important findings for later (save_knowledge) or search saved \
                          knowledge by keyword (search_knowledge).",
            summary: "Persist and search distilled knowledge.",
            auth_level: AuthLevel::Worker,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "'save_knowledge' or 'search_knowledge'.",
                },
                ToolParameter {
                    name: "summary",
                    param_type: ParamType::String,
                    required: false,
                    description: "Text to save (save_knowledge).",
                },
                ToolParameter {
                    name: "keywords",
                    param_type: ParamType::String,
                    required: false,
                    description: "Comma-separated keywords; extracted from the summary if omitted.",
                },
                ToolParameter {
                    name: "importance",
                    param_type: ParamType::Float,
                    required: false,
                    description: "0.0–1.0 importance weight, default 0.5.",
                },
                ToolParameter {
                    name: "query",
                    param_type: ParamType::String,
                    required: false,
                    description: "Keyword substring to search for (search_knowledge).",
                },
                ToolParameter {
                    name: "min_importance",
                    param_type: ParamType::Float,
                    required: false,
                    description: "Importance threshold for search, default 0.0.",
                },
            ],
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        match args.get("action").map(String::as_str).unwrap_or("") {
            "save_knowledge" => {
                let summary = match args.get("summary") {
                    Some(s) if !s.trim().is_empty() => s.trim(),
                    _ => return Ok(ToolResult::error("save_knowledge requires a summary.")),
                };
                let importance = args
                    .get("importance")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.5)
                    .clamp(0.0, 1.0);
                let item = self
                    .store
                    .save_knowledge(
                        ctx.session.as_deref(),
                        args.get("keywords").map(String::as_str),
                        summary,
                        None,
                        importance,
                    )
                    .await?;
                Ok(ToolResult::success_with(
                    format!("Knowledge saved with id {}.", item.id),
                    json!({ "id": item.id, "keywords": item.keywords }),
                ))
            }
            "search_knowledge" => {
                let query = args.get("query").cloned().unwrap_or_default();
                let min_importance = args
                    .get("min_importance")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let hits = self.store.search(&query, min_importance).await;
                let payload: Vec<serde_json::Value> = hits
                    .iter()
                    .take(10)
                    .map(|item| {
                        json!({
                            "id": item.id,
                            "keywords": item.keywords,
                            "summary": item.summary,
                            "importance": item.importance,
                        })
                    })
                    .collect();
                Ok(ToolResult::success_with(
                    format!("{} match(es).", payload.len()),
                    json!({ "results": payload }),
                ))
            }
            "" => Ok(ToolResult::error("knowledge_base requires an action parameter.")),
            other => Ok(ToolResult::error(format!(
                "Unrecognized knowledge_base action '{}'.",
                other
            ))),
        }
    }
}
