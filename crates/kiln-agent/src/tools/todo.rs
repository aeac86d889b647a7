use kiln_history::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::TODO_FILE;
use crate::errors::ToolError;
use crate::schema::{ArgType, ArgumentSchema};

use super::{
    RegisteredTool, TODO_ADD_TOOL, TODO_COMPLETE_TOOL, TODO_LIST_TOOL, TODO_REMOVE_TOOL,
    ToolContext, ToolDefinition,
};

/// Serializes read-modify-write cycles on the todo file within a process.
static TODO_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: u64,
    pub description: String,
    pub status: TodoStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TodoFile {
    next_id: u64,
    items: Vec<TodoItem>,
}

impl TodoFile {
    fn position(&self, id: u64) -> Result<usize, ToolError> {
        self.items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| ToolError::execution(format!("no todo item with id {id}")))
    }
}

pub(super) fn add_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            TODO_ADD_TOOL,
            "Add an item to the task list.",
            ArgumentSchema::new().required("description", ArgType::String, "What needs doing."),
        ),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let description = input.string("description")?.trim().to_string();
                if description.is_empty() {
                    return Err(ToolError::execution("description must not be empty"));
                }
                update(&context, |todos| {
                    todos.next_id += 1;
                    let item = TodoItem {
                        id: todos.next_id,
                        description,
                        status: TodoStatus::Pending,
                        created_at_ms: now_ms(),
                        completed_at_ms: None,
                    };
                    todos.items.push(item.clone());
                    Ok(json!(item))
                })
                .await
            })
        }),
    }
}

pub(super) fn list_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            TODO_LIST_TOOL,
            "List task items, optionally filtered by status.",
            ArgumentSchema::new().optional_with_default(
                "status",
                ArgType::String,
                Value::String("all".to_string()),
                "One of pending, completed, all.",
            ),
        ),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let filter = match input.optional_string("status").unwrap_or("all") {
                    "all" => None,
                    "pending" => Some(TodoStatus::Pending),
                    "completed" => Some(TodoStatus::Completed),
                    other => {
                        return Err(ToolError::execution(format!(
                            "status must be pending, completed or all, got '{other}'"
                        )));
                    }
                };
                let _guard = TODO_LOCK.lock().await;
                let todos = load(&todo_path(&context)).await?;
                let items: Vec<&TodoItem> = todos
                    .items
                    .iter()
                    .filter(|item| filter.is_none_or(|status| item.status == status))
                    .collect();
                Ok(json!({ "count": items.len(), "items": items }))
            })
        }),
    }
}

pub(super) fn complete_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            TODO_COMPLETE_TOOL,
            "Mark a task item as completed.",
            ArgumentSchema::new().required("id", ArgType::Integer, "Item id."),
        ),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let id = item_id(input.optional_u64("id"))?;
                update(&context, |todos| {
                    let position = todos.position(id)?;
                    let item = &mut todos.items[position];
                    if item.status != TodoStatus::Completed {
                        item.status = TodoStatus::Completed;
                        item.completed_at_ms = Some(now_ms());
                    }
                    Ok(json!(item))
                })
                .await
            })
        }),
    }
}

pub(super) fn remove_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            TODO_REMOVE_TOOL,
            "Remove a task item.",
            ArgumentSchema::new().required("id", ArgType::Integer, "Item id."),
        ),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let id = item_id(input.optional_u64("id"))?;
                update(&context, |todos| {
                    let position = todos.position(id)?;
                    let item = todos.items.remove(position);
                    Ok(json!({ "removed": item }))
                })
                .await
            })
        }),
    }
}

fn item_id(id: Option<u64>) -> Result<u64, ToolError> {
    id.ok_or_else(|| ToolError::execution("id must be a non-negative integer"))
}

fn todo_path(context: &ToolContext) -> PathBuf {
    context.workspace.root().join(TODO_FILE)
}

async fn update<F>(context: &ToolContext, change: F) -> Result<Value, ToolError>
where
    F: FnOnce(&mut TodoFile) -> Result<Value, ToolError>,
{
    let _guard = TODO_LOCK.lock().await;
    let path = todo_path(context);
    let mut todos = load(&path).await?;
    let output = change(&mut todos)?;
    save(&path, &todos).await?;
    Ok(output)
}

async fn load(path: &Path) -> Result<TodoFile, ToolError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|err| ToolError::execution(format!("corrupt todo file: {err}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TodoFile::default()),
        Err(err) => Err(err.into()),
    }
}

async fn save(path: &Path, todos: &TodoFile) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(todos)
        .map_err(|err| ToolError::execution(err.to_string()))?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}
