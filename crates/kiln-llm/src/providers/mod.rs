mod gemini;
mod scripted;

pub use gemini::{DEFAULT_GEMINI_BASE_URL, GeminiAdapter};
pub use scripted::ScriptedAdapter;
