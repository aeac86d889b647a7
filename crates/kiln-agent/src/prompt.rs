//! Rendering of the system prompt and of history into model messages.

use kiln_history::{HistoryEntry, HistoryRecord, ToolResult};
use kiln_llm::Message;
use std::fmt::Write as _;

use crate::config::{CONFIG_FILE, INSTRUCTION_FILE, STATE_DIR};
use crate::parser::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use crate::tools::ToolDescriptor;
use crate::truncation::truncate_tool_output;

const PROTOCOL: &str = r#"You are kiln, an autonomous agent that builds and tests web applications inside a single working directory.

# Output protocol
Reply with one or more tool calls, or with the termination tag, and nothing else:

  <tool_call>{"tool": "TOOL_NAME", "arguments": {...}}</tool_call>
  <terminate/>

- The payload inside <tool_call> must be a single valid JSON object.
- Calls in one reply run in the order written. Every call gets a result before your next turn.
- A reply with neither a tool call nor <terminate/> wastes a turn.
- Send <terminate/> alone once the instruction is satisfied and the tests pass.

# Rules
- Every path is relative to the working directory. Paths that escape it are rejected.
- Protected paths can be read but never written, edited or deleted.
- Tool results arrive as `[tool NAME #INDEX] {"ok": ..., "data" | "error": ...}`. Read errors and correct course.
"#;

/// Builds the system prompt: protocol, tool catalog in registration order
/// and the protected paths.
pub fn build_system_prompt(tools: &[ToolDescriptor], protected_files: &[String]) -> String {
    let mut prompt = String::from(PROTOCOL);

    prompt.push_str("\n# Tools\n");
    for tool in tools {
        let _ = writeln!(prompt, "\n## {}\n{}", tool.name, tool.description);
        let _ = writeln!(prompt, "parameters: {}", tool.parameters);
    }

    prompt.push_str("\n# Protected paths\n");
    let _ = writeln!(prompt, "- {STATE_DIR}/ (including {CONFIG_FILE} and {INSTRUCTION_FILE})");
    for path in protected_files {
        let _ = writeln!(prompt, "- {path}");
    }

    let _ = write!(
        prompt,
        "\n# Example\n{TOOL_CALL_OPEN}{{\"tool\": \"fs.read\", \"arguments\": {{\"path\": \"package.json\"}}}}{TOOL_CALL_CLOSE}\n"
    );
    prompt
}

/// `[tool <name> #<index>] <json>`, truncated to `limit` characters.
pub fn render_tool_result(tool: &str, call_index: usize, result: &ToolResult, limit: usize) -> String {
    let payload = serde_json::to_string(result)
        .unwrap_or_else(|err| format!("{{\"ok\":false,\"error\":\"unserializable result: {err}\"}}"));
    format!(
        "[tool {tool} #{call_index}] {}",
        truncate_tool_output(&payload, tool, limit)
    )
}

/// Converts history into the conversation sent to the model.
///
/// Session markers are never sent. With a `window`, the system prompt and
/// instruction are always kept plus the last `window` remaining entries.
pub fn history_to_messages(records: &[HistoryRecord], window: Option<usize>, tool_output_limit: usize) -> Vec<Message> {
    let (preamble, body): (Vec<&HistoryRecord>, Vec<&HistoryRecord>) = records
        .iter()
        .filter(|record| !matches!(record.entry, HistoryEntry::SessionMarker { .. }))
        .partition(|record| {
            matches!(
                record.entry,
                HistoryEntry::SystemPrompt { .. } | HistoryEntry::UserInstruction { .. }
            )
        });

    let skip = window.map_or(0, |window| body.len().saturating_sub(window));
    preamble
        .into_iter()
        .chain(body.into_iter().skip(skip))
        .filter_map(|record| entry_to_message(&record.entry, tool_output_limit))
        .collect()
}

fn entry_to_message(entry: &HistoryEntry, tool_output_limit: usize) -> Option<Message> {
    match entry {
        HistoryEntry::SystemPrompt { content } => Some(Message::system(content.clone())),
        HistoryEntry::UserInstruction { content } => Some(Message::user(content.clone())),
        HistoryEntry::ModelResponse { content } => Some(Message::assistant(content.clone())),
        HistoryEntry::ToolCallResult {
            call_index,
            tool,
            result,
            ..
        } => Some(Message::tool(render_tool_result(
            tool,
            *call_index,
            result,
            tool_output_limit,
        ))),
        HistoryEntry::SessionMarker { .. } => None,
    }
}
