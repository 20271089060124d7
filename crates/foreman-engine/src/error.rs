use foreman_core::cost::CostExceeded;
use foreman_core::git::GitError;
use foreman_core::schema::SchemaError;
use foreman_core::templates::TemplateError;
use foreman_gateway::GatewayError;
use foreman_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown tool {name}; registered tools: [{available}]")]
    UnknownTool { name: String, available: String },

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("must provide at least one workspace")]
    NoWorkspaces,

    #[error("task {0} still pending after handler returned")]
    TaskPending(i64),

    #[error("cannot rewind to {target}: {detail}")]
    Rewind { target: String, detail: String },

    #[error("step failed: {0}")]
    Step(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Aborted(#[from] CostExceeded),
}

impl EngineError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::UnknownTool { .. } => "UnknownToolError",
            Self::UnknownHandler(_) => "UnknownHandlerError",
            Self::NoWorkspaces => "NoWorkspacesError",
            Self::TaskPending(_) => "TaskPendingError",
            Self::Rewind { .. } => "RewindError",
            Self::Step(_) => "StepError",
            Self::Store(_) => "StoreError",
            Self::Gateway(_) => "GatewayError",
            Self::Git(_) => "GitError",
            Self::Template(_) => "TemplateError",
            Self::Schema(_) => "SchemaError",
            Self::Aborted(_) => "AbortCostExceeded",
        }
    }

    /// The cost abort inside this error, if that is what it is. Cost aborts
    /// must propagate out of the pipeline instead of being swallowed into the
    /// task.
    pub fn cost_abort(&self) -> Option<&CostExceeded> {
        match self {
            Self::Aborted(cost) => Some(cost),
            Self::Gateway(GatewayError::Aborted(cost)) => Some(cost),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::cost::CostType;

    fn cost() -> CostExceeded {
        CostExceeded {
            cost_type: CostType::Project,
            current_cost: 1.8,
            threshold: 1.0,
        }
    }

    #[test]
    fn cost_abort_detected_direct_and_through_gateway() {
        let direct = EngineError::Aborted(cost());
        assert!(direct.cost_abort().is_some());

        let nested = EngineError::Gateway(GatewayError::Aborted(cost()));
        assert!(nested.cost_abort().is_some());

        let other = EngineError::Config("x".into());
        assert!(other.cost_abort().is_none());
    }

    #[test]
    fn abort_message_passes_through() {
        let err = EngineError::Aborted(cost());
        assert_eq!(
            err.to_string(),
            "Abort: project cost $1.80 exceeds threshold $1.00"
        );
        assert_eq!(err.kind_name(), "AbortCostExceeded");
    }

    #[test]
    fn unknown_tool_lists_registry() {
        let err = EngineError::UnknownTool {
            name: "browse".into(),
            available: "edit, read".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown tool browse; registered tools: [edit, read]"
        );
    }
}
