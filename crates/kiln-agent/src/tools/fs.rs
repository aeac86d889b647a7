use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::schema::{ArgType, ArgumentSchema};
use crate::workspace::WorkspaceGuard;
use crate::ToolError;

use super::{
    FS_DELETE_TOOL, FS_EDIT_TOOL, FS_LS_TOOL, FS_MKDIR_TOOL, FS_READ_TOOL, FS_RMDIR_TOOL,
    FS_TREE_TOOL, FS_WRITE_TOOL, RegisteredTool, ToolDefinition,
};

/// Directories `fs.tree` lists but does not descend into.
const TREE_SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

pub(super) fn read_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_READ_TOOL,
            "Read a UTF-8 text file inside the working directory.",
            ArgumentSchema::new().required("path", ArgType::String, "File to read."),
        )
        .reads_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| io_failure("read", &context.workspace, path, err))?;
                Ok(json!({
                    "path": context.workspace.display(path),
                    "size": content.len(),
                    "line_count": content.lines().count(),
                    "content": content,
                }))
            })
        }),
    }
}

pub(super) fn write_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_WRITE_TOOL,
            "Create or overwrite a file. Parent directories are created as needed.",
            ArgumentSchema::new()
                .required("path", ArgType::String, "File to write.")
                .required("content", ArgType::String, "Full file content."),
        )
        .writes_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let content = input.string("content")?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| io_failure("create parent of", &context.workspace, path, err))?;
                }
                tokio::fs::write(path, content)
                    .await
                    .map_err(|err| io_failure("write", &context.workspace, path, err))?;
                Ok(json!({
                    "path": context.workspace.display(path),
                    "bytes": content.len(),
                }))
            })
        }),
    }
}

pub(super) fn edit_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_EDIT_TOOL,
            "Replace the first exact occurrence of old_text with new_text in a file.",
            ArgumentSchema::new()
                .required("path", ArgType::String, "File to edit.")
                .required("old_text", ArgType::String, "Exact text to find.")
                .required("new_text", ArgType::String, "Replacement text."),
        )
        .writes_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let old_text = input.string("old_text")?;
                let new_text = input.string("new_text")?;
                if old_text.is_empty() {
                    return Err(ToolError::execution("old_text must not be empty"));
                }

                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| io_failure("read", &context.workspace, path, err))?;
                let Some(position) = content.find(old_text) else {
                    return Err(ToolError::execution(format!(
                        "old_text not found in {}",
                        context.workspace.display(path)
                    )));
                };
                let mut updated = String::with_capacity(content.len() + new_text.len());
                updated.push_str(&content[..position]);
                updated.push_str(new_text);
                updated.push_str(&content[position + old_text.len()..]);
                tokio::fs::write(path, &updated)
                    .await
                    .map_err(|err| io_failure("write", &context.workspace, path, err))?;

                Ok(json!({
                    "path": context.workspace.display(path),
                    "replacements": 1,
                    "bytes": updated.len(),
                }))
            })
        }),
    }
}

pub(super) fn delete_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_DELETE_TOOL,
            "Delete a single file. Use fs.rmdir for directories.",
            ArgumentSchema::new().required("path", ArgType::String, "File to delete."),
        )
        .writes_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let metadata = tokio::fs::symlink_metadata(path)
                    .await
                    .map_err(|err| io_failure("stat", &context.workspace, path, err))?;
                if metadata.is_dir() {
                    return Err(ToolError::execution(format!(
                        "{} is a directory; use fs.rmdir",
                        context.workspace.display(path)
                    )));
                }
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|err| io_failure("delete", &context.workspace, path, err))?;
                Ok(json!({ "deleted": context.workspace.display(path) }))
            })
        }),
    }
}

pub(super) fn mkdir_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_MKDIR_TOOL,
            "Create a directory and any missing parents.",
            ArgumentSchema::new().required("path", ArgType::String, "Directory to create."),
        )
        .writes_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let existed = tokio::fs::try_exists(path).await.unwrap_or(false);
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|err| io_failure("create", &context.workspace, path, err))?;
                Ok(json!({
                    "path": context.workspace.display(path),
                    "created": !existed,
                }))
            })
        }),
    }
}

pub(super) fn rmdir_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_RMDIR_TOOL,
            "Remove a directory. Non-empty directories require recursive=true.",
            ArgumentSchema::new()
                .required("path", ArgType::String, "Directory to remove.")
                .optional_with_default(
                    "recursive",
                    ArgType::Boolean,
                    Value::Bool(false),
                    "Remove contents as well.",
                ),
        )
        .writes_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let recursive = input.optional_bool("recursive").unwrap_or(false);
                let metadata = tokio::fs::symlink_metadata(path)
                    .await
                    .map_err(|err| io_failure("stat", &context.workspace, path, err))?;
                if !metadata.is_dir() {
                    return Err(ToolError::execution(format!(
                        "{} is not a directory; use fs.delete",
                        context.workspace.display(path)
                    )));
                }
                let removed = if recursive {
                    tokio::fs::remove_dir_all(path).await
                } else {
                    tokio::fs::remove_dir(path).await
                };
                removed.map_err(|err| io_failure("remove", &context.workspace, path, err))?;
                Ok(json!({ "removed": context.workspace.display(path) }))
            })
        }),
    }
}

pub(super) fn ls_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_LS_TOOL,
            "List the entries of a directory, sorted by name.",
            ArgumentSchema::new().optional_with_default(
                "path",
                ArgType::String,
                Value::String(".".to_string()),
                "Directory to list.",
            ),
        )
        .reads_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?;
                let mut reader = tokio::fs::read_dir(path)
                    .await
                    .map_err(|err| io_failure("list", &context.workspace, path, err))?;
                let mut entries = Vec::new();
                while let Some(entry) = reader.next_entry().await? {
                    let file_type = entry.file_type().await?;
                    let size = if file_type.is_file() {
                        entry.metadata().await.map(|meta| meta.len()).unwrap_or(0)
                    } else {
                        0
                    };
                    entries.push((
                        entry.file_name().to_string_lossy().into_owned(),
                        entry_kind(&file_type),
                        size,
                    ));
                }
                entries.sort_by(|left, right| left.0.cmp(&right.0));

                let entries: Vec<Value> = entries
                    .into_iter()
                    .map(|(name, kind, size)| json!({ "name": name, "type": kind, "size": size }))
                    .collect();
                Ok(json!({
                    "path": context.workspace.display(path),
                    "entries": entries,
                }))
            })
        }),
    }
}

pub(super) fn tree_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            FS_TREE_TOOL,
            "Recursively list a directory up to max_depth levels.",
            ArgumentSchema::new()
                .optional_with_default(
                    "path",
                    ArgType::String,
                    Value::String(".".to_string()),
                    "Directory to walk.",
                )
                .optional_with_default(
                    "max_depth",
                    ArgType::Integer,
                    json!(2),
                    "Maximum depth below path.",
                ),
        )
        .reads_path("path"),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = input.path("path")?.to_path_buf();
                let max_depth = input.optional_u64("max_depth").unwrap_or(2).max(1) as usize;
                let workspace = context.workspace.clone();
                let display = workspace.display(&path);

                let entries = tokio::task::spawn_blocking(move || walk_tree(&workspace, &path, max_depth))
                    .await
                    .map_err(|err| ToolError::execution(format!("tree walk aborted: {err}")))??;
                Ok(json!({ "path": display, "entries": entries }))
            })
        }),
    }
}

fn walk_tree(workspace: &WorkspaceGuard, root: &Path, max_depth: usize) -> Result<Vec<Value>, ToolError> {
    if !root.is_dir() {
        return Err(ToolError::execution(format!(
            "{} is not a directory",
            workspace.display(root)
        )));
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() <= 1
                || !entry
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| TREE_SKIPPED_DIRS.contains(&name))
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| ToolError::execution(err.to_string()))?;
        entries.push(json!({
            "path": workspace.display(entry.path()),
            "type": entry_kind(&entry.file_type()),
            "depth": entry.depth(),
        }));
    }
    Ok(entries)
}

fn entry_kind(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "dir"
    } else {
        "file"
    }
}

fn io_failure(action: &str, workspace: &WorkspaceGuard, path: &Path, err: std::io::Error) -> ToolError {
    ToolError::execution(format!("cannot {action} {}: {err}", workspace.display(path)))
}
