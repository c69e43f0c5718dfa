pub mod backend;
pub mod embed;
pub mod reliable;
pub mod router;
pub mod scripted;

pub use backend::{CompletionRequest, ModelBackend, UnconfiguredBackend};
pub use embed::HashingEmbedder;
pub use reliable::{ReliableBackend, ReliableConfig};
pub use router::ModelRouter;
pub use scripted::{ScriptedBackend, ScriptedResponse};
