pub mod chat;
pub mod cost;
pub mod git;
pub mod ids;
pub mod schema;
pub mod templates;
pub mod tools;

pub use chat::{BackendError, ChatBackend, ChatMessage, Role, TokenUsage};
pub use cost::{CostExceeded, CostOracle, CostTotals, CostType};
pub use git::{Git, GitError};
pub use ids::ChatId;
pub use schema::SchemaBuilder;
pub use templates::Templates;
pub use tools::Tool;
