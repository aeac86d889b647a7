//! Orchestration core for the kiln coding agent.
//!
//! A [`Session`] drives the turn loop: it queries the model through
//! `kiln_llm`, parses tool calls out of the raw response, runs them through
//! the [`ToolRegistry`] (schema validation, then the [`WorkspaceGuard`], then
//! execution) and appends every step to a `kiln_history` store. Long-running
//! processes such as development servers live in the [`ProcessSupervisor`]
//! and keep running between turns.

pub mod config;
pub mod errors;
pub mod events;
pub mod parser;
pub mod process;
pub mod prompt;
pub mod schema;
pub mod session;
pub mod tools;
pub mod truncation;
pub mod workspace;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use parser::*;
pub use process::*;
pub use prompt::*;
pub use schema::*;
pub use session::*;
pub use tools::*;
pub use truncation::*;
pub use workspace::*;

pub use kiln_history::ToolResult;
