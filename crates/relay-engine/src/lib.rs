pub mod assembler;
pub mod bus;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod session;

pub use assembler::{AssemblerConfig, ContextAssembler, ContextBundle};
pub use bus::{EventBus, EventStream};
pub use error::EngineError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, RecoveryConfig};
pub use registry::{OptionProvider, ToolRegistry};
pub use runner::{AgentRunner, RunnerConfig};
pub use session::Session;
