mod fs;
mod registry;
mod scaffold;
mod server;
mod test_runner;
mod todo;

use std::collections::HashSet;

use crate::{AgentError, SessionConfig};

pub use registry::{
    BatchProgress, PathAccess, PathParam, RegisteredTool, ToolCallReport, ToolContext, ToolDefinition,
    ToolDescriptor, ToolExecutor, ToolFuture, ToolInput, ToolRegistry,
};
pub use test_runner::{TestSummary, parse_test_summary};
pub use todo::{TodoItem, TodoStatus};

pub const FS_READ_TOOL: &str = "fs.read";
pub const FS_WRITE_TOOL: &str = "fs.write";
pub const FS_EDIT_TOOL: &str = "fs.edit";
pub const FS_DELETE_TOOL: &str = "fs.delete";
pub const FS_MKDIR_TOOL: &str = "fs.mkdir";
pub const FS_RMDIR_TOOL: &str = "fs.rmdir";
pub const FS_LS_TOOL: &str = "fs.ls";
pub const FS_TREE_TOOL: &str = "fs.tree";
pub const SERVER_START_TOOL: &str = "server.start";
pub const SERVER_STOP_TOOL: &str = "server.stop";
pub const SERVER_STATUS_TOOL: &str = "server.status";
pub const SERVER_LOGS_TOOL: &str = "server.logs";
pub const NPM_INIT_TOOL: &str = "npm.init";
pub const SUPERTEST_INIT_TOOL: &str = "supertest.init";
pub const PLAYWRIGHT_INIT_TOOL: &str = "playwright.init";
pub const TESTS_RUN_TOOL: &str = "tests.run";
pub const TODO_ADD_TOOL: &str = "todo.add";
pub const TODO_LIST_TOOL: &str = "todo.list";
pub const TODO_COMPLETE_TOOL: &str = "todo.complete";
pub const TODO_REMOVE_TOOL: &str = "todo.remove";

/// Every built-in tool, in catalog order.
pub fn builtin_tools(config: &SessionConfig) -> Vec<RegisteredTool> {
    vec![
        fs::read_tool(),
        fs::write_tool(),
        fs::edit_tool(),
        fs::delete_tool(),
        fs::mkdir_tool(),
        fs::rmdir_tool(),
        fs::ls_tool(),
        fs::tree_tool(),
        server::start_tool(config),
        server::stop_tool(),
        server::status_tool(),
        server::logs_tool(),
        scaffold::npm_init_tool(config),
        scaffold::supertest_init_tool(config),
        scaffold::playwright_init_tool(config),
        test_runner::run_tool(config),
        todo::add_tool(),
        todo::list_tool(),
        todo::complete_tool(),
        todo::remove_tool(),
    ]
}

/// Registers the built-ins, restricted to `allowed_tools` when the config
/// sets it. Naming a tool that does not exist is a configuration error.
pub fn build_registry(config: &SessionConfig) -> Result<ToolRegistry, AgentError> {
    let tools = builtin_tools(config);
    let allowed: Option<HashSet<&str>> = config
        .allowed_tools
        .as_ref()
        .map(|names| names.iter().map(String::as_str).collect());

    if let Some(allowed) = &allowed {
        let known: HashSet<&str> = tools
            .iter()
            .map(|tool| tool.definition.name.as_str())
            .collect();
        let mut unknown: Vec<&str> = allowed.difference(&known).copied().collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(AgentError::InvalidConfiguration(format!(
                "allowed_tools names unknown tools: {}",
                unknown.join(", ")
            )));
        }
    }

    let mut registry = ToolRegistry::new();
    for tool in tools {
        let keep = allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(tool.definition.name.as_str()));
        if keep {
            registry.register(tool)?;
        }
    }
    Ok(registry)
}
