pub mod batch;
pub mod error;
pub mod git;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod session;

pub use batch::{Batch, RepoConfig, StoreArg, WorkspaceSource, WorkspaceSpec};
pub use error::EngineError;
pub use git::CliGit;
pub use pipeline::{AgentStep, Pipeline, ReviewLoop, StepContext};
pub use processor::{AfterEach, Handler, Processor};
pub use registry::{ToolFactory, ToolRegistry, ToolSpec};
pub use session::{ChatTransport, PromptRequest, Session, SessionConfig};
