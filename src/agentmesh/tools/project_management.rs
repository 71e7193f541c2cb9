//! Task tracking tool.
//!
//! Keeps a per-project task list in memory: PMs add tasks from the project
//! plan, list them, and assign them to workers with `modify_task`. The
//! interaction handler watches `modify_task` results for an `assignee` so it
//! can activate the worker that just received a task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::agentmesh::tool_protocol::{
    AuthLevel, ParamType, Tool, ToolContext, ToolParameter, ToolResult, ToolSchema,
};

/// One tracked task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_uuid: String,
    pub description: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
}

type TaskStore = Arc<Mutex<HashMap<String, Vec<TaskRecord>>>>;

pub struct ProjectManagementTool {
    /// project name → tasks.
    tasks: TaskStore,
}

impl ProjectManagementTool {
    pub fn new() -> Self {
        ProjectManagementTool {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed a task directly (used by the manager when a project is created
    /// with its initial "Project Plan" task).
    pub async fn seed_task(&self, project: &str, description: &str) -> TaskRecord {
        let record = TaskRecord {
            task_uuid: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            status: "todo".to_string(),
            assignee: None,
            created_at: Utc::now(),
        };
        self.tasks
            .lock()
            .await
            .entry(project.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    pub async fn tasks_for(&self, project: &str) -> Vec<TaskRecord> {
        self.tasks
            .lock()
            .await
            .get(project)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for ProjectManagementTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ProjectManagementTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "project_management",
            description: "Track project tasks: add_task, list_tasks, modify_task (assign or \
                          change status by task_uuid).",
            summary: "Add, list and modify project tasks.",
            auth_level: AuthLevel::Pm,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "'add_task', 'list_tasks' or 'modify_task'.",
                },
                ToolParameter {
                    name: "description",
                    param_type: ParamType::String,
                    required: false,
                    description: "Task description (add_task).",
                },
                ToolParameter {
                    name: "task_uuid",
                    param_type: ParamType::String,
                    required: false,
                    description: "Task to modify; UUIDs come from list_tasks.",
                },
                ToolParameter {
                    name: "assignee",
                    param_type: ParamType::String,
                    required: false,
                    description: "Worker agent id to assign the task to (modify_task).",
                },
                ToolParameter {
                    name: "status",
                    param_type: ParamType::String,
                    required: false,
                    description: "New task status: todo, in_progress, done (modify_task).",
                },
            ],
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        let project = match &ctx.project {
            Some(project) => project.clone(),
            None => return Ok(ToolResult::error("No active project for task management.")),
        };
        let action = args.get("action").map(String::as_str).unwrap_or("");

        match action {
            "add_task" => {
                let description = match args.get("description") {
                    Some(d) if !d.trim().is_empty() => d.trim().to_string(),
                    _ => return Ok(ToolResult::error("add_task requires a description.")),
                };
                let record = TaskRecord {
                    task_uuid: uuid::Uuid::new_v4().to_string(),
                    description,
                    status: "todo".to_string(),
                    assignee: None,
                    created_at: Utc::now(),
                };
                let mut tasks = self.tasks.lock().await;
                tasks.entry(project).or_default().push(record.clone());
                Ok(ToolResult::success_with(
                    format!("Task created with UUID {}.", record.task_uuid),
                    json!({ "action": "add_task", "task_uuid": record.task_uuid }),
                ))
            }
            "list_tasks" => {
                let tasks = self.tasks.lock().await;
                let list = tasks.get(&project).cloned().unwrap_or_default();
                let payload: Vec<serde_json::Value> = list
                    .iter()
                    .map(|t| {
                        json!({
                            "task_uuid": t.task_uuid,
                            "description": t.description,
                            "status": t.status,
                            "assignee": t.assignee,
                        })
                    })
                    .collect();
                Ok(ToolResult::success_with(
                    format!("{} task(s) in project '{}'.", payload.len(), project),
                    json!({ "action": "list_tasks", "tasks": payload }),
                ))
            }
            "modify_task" => {
                let task_uuid = match args.get("task_uuid").or_else(|| args.get("task_id")) {
                    Some(u) if !u.is_empty() => u.clone(),
                    _ => {
                        return Ok(ToolResult::error(
                            "modify_task requires a task_uuid (use list_tasks to obtain it).",
                        ))
                    }
                };
                let mut tasks = self.tasks.lock().await;
                let list = tasks.entry(project.clone()).or_default();
                let task = match list.iter_mut().find(|t| t.task_uuid == task_uuid) {
                    Some(task) => task,
                    None => {
                        return Ok(ToolResult::error(format!(
                            "No task with UUID '{}' in project '{}'.",
                            task_uuid, project
                        )))
                    }
                };
                if let Some(assignee) = args.get("assignee") {
                    if !assignee.is_empty() {
                        task.assignee = Some(assignee.clone());
                        if task.status == "todo" {
                            task.status = "in_progress".to_string();
                        }
                    }
                }
                if let Some(status) = args.get("status") {
                    if !status.is_empty() {
                        task.status = status.clone();
                    }
                }
                let assignee = task.assignee.clone();
                let description = task.description.clone();
                Ok(ToolResult::success_with(
                    format!("Task {} updated.", task_uuid),
                    json!({
                        "action": "modify_task",
                        "task_uuid": task_uuid,
                        "assignee": assignee,
                        "description": description,
                    }),
                ))
            }
            "" => Ok(ToolResult::error("project_management requires an action parameter.")),
            other => Ok(ToolResult::error(format!(
                "Unrecognized project_management action '{}'.",
                other
            ))),
        }
    }
}
