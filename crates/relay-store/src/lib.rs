pub mod checkpoints;
pub mod database;
pub mod error;
pub mod history;
pub mod memory;
pub mod schema;

pub use checkpoints::{Checkpointer, MemoryCheckpointer, SqliteCheckpointer};
pub use database::Database;
pub use error::StoreError;
pub use history::HistoryRepo;
pub use memory::{MemoryConfig, MemoryItem, MemoryScope, MemoryStore, ScoredItem};
