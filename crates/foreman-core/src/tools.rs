//! Tool boundary. The engine resolves tools by name, binds them to a
//! workspace directory, and hands them to the chat backend; the tools
//! themselves (read/edit/grep/…) live outside the core.

use async_trait::async_trait;
use serde_json::Value;

pub type ToolArgs = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
#[error("tool {name} failed: {message}")]
pub struct ToolError {
    pub name: String,
    pub message: String,
}

#[async_trait(?Send)]
pub trait Tool {
    fn name(&self) -> &str;

    /// JSON definition handed to the model (name, description, input schema).
    fn definition(&self) -> Value;

    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}
