pub mod fs;
pub mod memory;
pub mod replay;
pub mod store;
pub mod types;

pub use fs::JsonlHistoryStore;
pub use memory::MemoryHistoryStore;
pub use replay::{load_history, verify_chain};
pub use store::{HistoryStore, HistoryStoreError, HistoryResult};
pub use types::{GENESIS_HASH, HistoryEntry, HistoryRecord, ToolResult, now_ms};
