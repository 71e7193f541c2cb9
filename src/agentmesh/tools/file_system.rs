//! Sandboxed file-system tool.
//!
//! All paths are resolved inside the calling agent's sandbox; traversal
//! outside it (absolute paths, `..` segments) is rejected before any I/O.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::agentmesh::tool_protocol::{
    AuthLevel, ParamType, Tool, ToolContext, ToolParameter, ToolResult, ToolSchema,
};

/// Maximum file size the read action will return.
const MAX_READ_BYTES: u64 = 512 * 1024;

pub struct FileSystemTool;

fn resolve_sandboxed(sandbox: &Path, relative: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err("Absolute paths are not allowed; use a path relative to your sandbox.".into());
    }
    let mut resolved = sandbox.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err("Path may not traverse outside the sandbox.".into()),
        }
    }
    Ok(resolved)
}

#[async_trait]
impl Tool for FileSystemTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "file_system",
            description: "Read, write and list files inside your sandbox: read_file, \
                          write_file, list_files.",
            summary: "Sandboxed file operations.",
            auth_level: AuthLevel::Worker,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "'read_file', 'write_file' or 'list_files'.",
                },
                ToolParameter {
                    name: "filepath",
                    param_type: ParamType::String,
                    required: false,
                    description: "Path relative to your sandbox.",
                },
                ToolParameter {
                    name: "content",
                    param_type: ParamType::String,
                    required: false,
                    description: "File body (write_file).",
                },
            ],
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &HashMap<String, String>,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        let action = args.get("action").map(String::as_str).unwrap_or("");
        match action {
            "read_file" => {
                let filepath = match args.get("filepath") {
                    Some(p) if !p.is_empty() => p,
                    _ => return Ok(ToolResult::error("read_file requires a filepath.")),
                };
                let path = match resolve_sandboxed(&ctx.sandbox_path, filepath) {
                    Ok(path) => path,
                    Err(msg) => return Ok(ToolResult::error(msg)),
                };
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() > MAX_READ_BYTES => {
                        return Ok(ToolResult::error(format!(
                            "File '{}' is too large to read ({} bytes).",
                            filepath,
                            meta.len()
                        )))
                    }
                    Err(e) => {
                        return Ok(ToolResult::error(format!(
                            "Cannot read '{}': {}",
                            filepath, e
                        )))
                    }
                    _ => {}
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => Ok(ToolResult::success_with(
                        format!("Read {} bytes from '{}'.", content.len(), filepath),
                        json!({ "filepath": filepath, "content": content }),
                    )),
                    Err(e) => Ok(ToolResult::error(format!("Cannot read '{}': {}", filepath, e))),
                }
            }
            "write_file" => {
                let filepath = match args.get("filepath") {
                    Some(p) if !p.is_empty() => p,
                    _ => return Ok(ToolResult::error("write_file requires a filepath.")),
                };
                let content = args.get("content").cloned().unwrap_or_default();
                let path = match resolve_sandboxed(&ctx.sandbox_path, filepath) {
                    Ok(path) => path,
                    Err(msg) => return Ok(ToolResult::error(msg)),
                };
                if let Some(parent) = path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return Ok(ToolResult::error(format!(
                            "Cannot create directory for '{}': {}",
                            filepath, e
                        )));
                    }
                }
                match tokio::fs::write(&path, content.as_bytes()).await {
                    Ok(()) => Ok(ToolResult::success_with(
                        format!("Wrote {} bytes to '{}'.", content.len(), filepath),
                        json!({ "filepath": filepath, "bytes_written": content.len() }),
                    )),
                    Err(e) => Ok(ToolResult::error(format!("Cannot write '{}': {}", filepath, e))),
                }
            }
            "list_files" => {
                let relative = args.get("filepath").cloned().unwrap_or_default();
                let path = if relative.is_empty() {
                    ctx.sandbox_path.clone()
                } else {
                    match resolve_sandboxed(&ctx.sandbox_path, &relative) {
                        Ok(path) => path,
                        Err(msg) => return Ok(ToolResult::error(msg)),
                    }
                };
                let mut entries = Vec::new();
                let mut reader = match tokio::fs::read_dir(&path).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        return Ok(ToolResult::error(format!("Cannot list '{}': {}", relative, e)))
                    }
                };
                while let Ok(Some(entry)) = reader.next_entry().await {
                    entries.push(entry.file_name().to_string_lossy().to_string());
                }
                entries.sort();
                Ok(ToolResult::success_with(
                    format!("{} entr(ies) in '{}'.", entries.len(), relative),
                    json!({ "path": relative, "entries": entries }),
                ))
            }
            "" => Ok(ToolResult::error("file_system requires an action parameter.")),
            other => Ok(ToolResult::error(format!(
                "Unrecognized file_system action '{}'.",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::agent::AgentKind;
    use crate::agentmesh::tool_protocol::ToolStatus;

    fn ctx(sandbox: &Path) -> ToolContext {
        ToolContext {
            agent_id: "w1".to_string(),
            agent_kind: AgentKind::Worker,
            sandbox_path: sandbox.to_path_buf(),
            project: None,
            session: None,
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile_dir();
        let tool = FileSystemTool;
        let mut args = HashMap::new();
        args.insert("action".to_string(), "write_file".to_string());
        args.insert("filepath".to_string(), "src/index.js".to_string());
        args.insert("content".to_string(), "console.log(1)".to_string());
        let written = tool.execute(&ctx(&dir), &args).await.unwrap();
        assert_eq!(written.status, ToolStatus::Success);

        args.insert("action".to_string(), "read_file".to_string());
        args.remove("content");
        let read = tool.execute(&ctx(&dir), &args).await.unwrap();
        assert_eq!(read.data["content"], "console.log(1)");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_escape_rejected() {
        let dir = tempfile_dir();
        let tool = FileSystemTool;
        let mut args = HashMap::new();
        args.insert("action".to_string(), "read_file".to_string());
        args.insert("filepath".to_string(), "../outside.txt".to_string());
        let result = tool.execute(&ctx(&dir), &args).await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);

        args.insert("filepath".to_string(), "/etc/passwd".to_string());
        let result = tool.execute(&ctx(&dir), &args).await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "agentmesh_fs_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
