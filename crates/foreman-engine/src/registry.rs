//! Tool resolution. The engine never implements tools; it resolves names,
//! factories, or ready instances against a registry and binds them to a
//! workspace directory before handing them to the chat backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use foreman_core::tools::{Tool, ToolArgs};

use crate::error::EngineError;

/// Builds a tool from merged arguments. The Rust stand-in for "a tool class".
pub type ToolFactory = Arc<dyn Fn(ToolArgs) -> Arc<dyn Tool>>;

/// A value that resolves to a tool: a registry name, a factory, or an
/// already-built instance.
#[derive(Clone)]
pub enum ToolSpec {
    Name(String),
    Factory { name: String, factory: ToolFactory },
    Instance(Arc<dyn Tool>),
}

impl ToolSpec {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn factory(name: impl Into<String>, factory: ToolFactory) -> Self {
        Self::Factory {
            name: name.into(),
            factory,
        }
    }

    pub fn instance(tool: Arc<dyn Tool>) -> Self {
        Self::Instance(tool)
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "ToolSpec::Name({name})"),
            Self::Factory { name, .. } => write!(f, "ToolSpec::Factory({name})"),
            Self::Instance(tool) => write!(f, "ToolSpec::Instance({})", tool.name()),
        }
    }
}

/// Name → factory map. Built-ins live outside the core, so a registry starts
/// empty and is filled from the session's extra-tools configuration.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    factories: BTreeMap<String, ToolFactory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ToolFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Union with `extras`; extras win on name clashes.
    pub fn merged(&self, extras: &ToolRegistry) -> ToolRegistry {
        let mut factories = self.factories.clone();
        for (name, factory) in &extras.factories {
            factories.insert(name.clone(), Arc::clone(factory));
        }
        ToolRegistry { factories }
    }

    /// Resolve a spec into an instance, injecting `workspace_dir` into the
    /// factory arguments when the caller did not set one.
    pub fn resolve(
        &self,
        spec: &ToolSpec,
        tool_args: &ToolArgs,
        workspace_dir: &Path,
    ) -> Result<Arc<dyn Tool>, EngineError> {
        match spec {
            ToolSpec::Instance(tool) => Ok(Arc::clone(tool)),
            ToolSpec::Factory { factory, .. } => {
                Ok(factory(with_workspace_dir(tool_args, workspace_dir)))
            }
            ToolSpec::Name(name) => {
                let factory = self.factories.get(name).ok_or_else(|| {
                    EngineError::UnknownTool {
                        name: name.clone(),
                        available: self.names().join(", "),
                    }
                })?;
                Ok(factory(with_workspace_dir(tool_args, workspace_dir)))
            }
        }
    }
}

fn with_workspace_dir(args: &ToolArgs, workspace_dir: &Path) -> ToolArgs {
    let mut merged = args.clone();
    merged
        .entry("workspace_dir".to_owned())
        .or_insert_with(|| Value::String(workspace_dir.to_string_lossy().into_owned()));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::tools::ToolError;
    use serde_json::json;

    struct RecordedTool {
        args: ToolArgs,
    }

    #[async_trait(?Send)]
    impl Tool for RecordedTool {
        fn name(&self) -> &str {
            "recorded"
        }

        fn definition(&self) -> Value {
            json!({"name": "recorded"})
        }

        async fn call(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(Value::Object(self.args.clone()))
        }
    }

    fn factory() -> ToolFactory {
        Arc::new(|args| Arc::new(RecordedTool { args }))
    }

    #[tokio::test]
    async fn name_resolves_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register("recorded", factory());

        let tool = registry
            .resolve(
                &ToolSpec::name("recorded"),
                &ToolArgs::new(),
                Path::new("/work/wt-0"),
            )
            .unwrap();
        let seen = tool.call(Value::Null).await.unwrap();
        assert_eq!(seen["workspace_dir"], "/work/wt-0");
    }

    #[test]
    fn unknown_name_lists_registry() {
        let mut registry = ToolRegistry::new();
        registry.register("edit", factory());
        registry.register("read", factory());

        let err = registry
            .resolve(&ToolSpec::name("browse"), &ToolArgs::new(), Path::new("/w"))
            .unwrap_err();
        match err {
            EngineError::UnknownTool { name, available } => {
                assert_eq!(name, "browse");
                assert_eq!(available, "edit, read");
            }
            other => panic!("expected UnknownTool, got: {other}"),
        }
    }

    #[tokio::test]
    async fn caller_args_beat_workspace_injection() {
        let registry = ToolRegistry::new();
        let mut args = ToolArgs::new();
        args.insert("workspace_dir".into(), json!("/custom"));

        let tool = registry
            .resolve(
                &ToolSpec::factory("recorded", factory()),
                &args,
                Path::new("/default"),
            )
            .unwrap();
        let seen = tool.call(Value::Null).await.unwrap();
        assert_eq!(seen["workspace_dir"], "/custom");
    }

    #[tokio::test]
    async fn instance_passes_through_untouched() {
        let registry = ToolRegistry::new();
        let tool: Arc<dyn Tool> = Arc::new(RecordedTool {
            args: ToolArgs::new(),
        });
        let resolved = registry
            .resolve(&ToolSpec::instance(Arc::clone(&tool)), &ToolArgs::new(), Path::new("/w"))
            .unwrap();
        assert!(Arc::ptr_eq(&tool, &resolved));
    }

    #[test]
    fn merged_registry_prefers_extras() {
        let mut base = ToolRegistry::new();
        base.register("edit", factory());
        let mut extras = ToolRegistry::new();
        extras.register("edit", factory());
        extras.register("special", factory());

        let merged = base.merged(&extras);
        assert_eq!(merged.names(), vec!["edit", "special"]);
    }
}
