//! Agent steps: a pipeline step whose body is one structured LLM exchange.
//! Prompt material resolves from an inline payload, template keys, or
//! per-parameter overrides, in that precedence.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::instrument;

use foreman_core::templates::interpolate;
use foreman_core::SchemaBuilder;
use foreman_gateway::ChatResponse;

use crate::error::EngineError;
use crate::pipeline::StepContext;
use crate::registry::ToolSpec;
use crate::session::PromptRequest;

/// Fully resolved material for one exchange.
#[derive(Clone, Default)]
pub struct AgentPrompt {
    pub prompt: Option<String>,
    pub cached_prompt: Vec<String>,
    pub tools: Vec<ToolSpec>,
    pub schema: Option<Value>,
}

pub type PayloadFn = Arc<dyn Fn(&StepContext) -> Result<AgentPrompt, EngineError>>;

/// Per-parameter overrides. Keys resolve through templates; literals pass
/// through untouched.
#[derive(Clone, Default)]
pub struct AgentParams {
    pub prompt: Option<String>,
    pub prompt_key: Option<String>,
    pub cached_prompts: Option<Vec<String>>,
    pub cached_prompt_keys: Option<Vec<String>>,
    pub tools: Option<Vec<ToolSpec>>,
    pub schema: Option<Value>,
}

pub struct AgentStep {
    pub name: String,
    params: AgentParams,
    payload: Option<PayloadFn>,
}

impl AgentStep {
    /// Derive everything from templates under `<name>.prompt`,
    /// `<name>.cached_prompts`, `<name>.tools`, `<name>.response_schema`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: AgentParams::default(),
            payload: None,
        }
    }

    pub fn with_params(name: impl Into<String>, params: AgentParams) -> Self {
        Self {
            name: name.into(),
            params,
            payload: None,
        }
    }

    /// The payload closure wins over everything else.
    pub fn with_payload<F>(name: impl Into<String>, payload: F) -> Self
    where
        F: Fn(&StepContext) -> Result<AgentPrompt, EngineError> + 'static,
    {
        Self {
            name: name.into(),
            params: AgentParams::default(),
            payload: Some(Arc::new(payload)),
        }
    }
}

pub(crate) async fn run(ctx: &mut StepContext, spec: &AgentStep) -> Result<(), EngineError> {
    run_prompt(ctx, spec, &Map::new()).await
}

/// Resolve, prompt, record the chat id, then apply the outcome: a success
/// updates the record, an error response fails the task.
#[instrument(skip_all, fields(agent_step = %spec.name))]
pub(crate) async fn run_prompt(
    ctx: &mut StepContext,
    spec: &AgentStep,
    additional: &Map<String, Value>,
) -> Result<(), EngineError> {
    let resolved = resolve_prompt(ctx, spec, additional)?;
    let prompt = resolved.prompt.ok_or_else(|| {
        EngineError::Config(format!("agent step {} resolved no prompt", spec.name))
    })?;

    let mut request = PromptRequest::new(prompt)
        .cached_prompt(resolved.cached_prompt)
        .tools(resolved.tools)
        .workspace_dir(ctx.workspace().dir.clone());
    if let Some(schema) = resolved.schema {
        request = request.schema(schema);
    }

    let session = Arc::clone(ctx.session());
    let (chat_id, response) = session.prompt_on(ctx.conn(), request).await?;
    ctx.append_chat_id(chat_id.as_str())?;

    match response {
        ChatResponse::Success { data } => {
            if !data.is_empty() && ctx.record().is_some() {
                ctx.update_record(data)?;
            }
        }
        ChatResponse::Error { error_message } => {
            ctx.fail(&error_message)?;
        }
    }
    Ok(())
}

/// Parameter resolution, in precedence order: payload closure, pure template
/// derivation, per-parameter overrides merged over template defaults.
pub(crate) fn resolve_prompt(
    ctx: &StepContext,
    spec: &AgentStep,
    additional: &Map<String, Value>,
) -> Result<AgentPrompt, EngineError> {
    if let Some(payload) = &spec.payload {
        return payload(ctx);
    }

    let templates = Arc::clone(ctx.session().templates());
    let mut attrs = match (ctx.record(), ctx.record_handle()) {
        (Some(record), Some(handle)) => handle.prompt_attrs(record),
        _ => Map::new(),
    };
    for (key, value) in additional {
        attrs.insert(key.clone(), value.clone());
    }

    let params = &spec.params;

    let prompt = match (&params.prompt, &params.prompt_key) {
        // Inline literals skip interpolation.
        (Some(literal), _) => Some(literal.clone()),
        (None, Some(key)) => Some(templates.t(key, &attrs)?),
        (None, None) => Some(templates.t(&format!("{}.prompt", spec.name), &attrs)?),
    };

    let cached_prompt = if let Some(cached) = &params.cached_prompts {
        cached.clone()
    } else if let Some(keys) = &params.cached_prompt_keys {
        keys.iter()
            .map(|key| templates.t(key, &attrs))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        templates
            .strings(&format!("{}.cached_prompts", spec.name))
            .unwrap_or_default()
            .iter()
            .map(|template| interpolate(template, &attrs))
            .collect()
    };

    let tools = if let Some(tools) = &params.tools {
        tools.clone()
    } else {
        templates
            .strings(&format!("{}.tools", spec.name))
            .unwrap_or_default()
            .into_iter()
            .map(ToolSpec::name)
            .collect()
    };

    let schema = if let Some(schema) = &params.schema {
        Some(schema.clone())
    } else if let Some(description) = templates.value(&format!("{}.response_schema", spec.name)) {
        Some(SchemaBuilder::from_value(&description)?)
    } else {
        None
    };

    Ok(AgentPrompt {
        prompt,
        cached_prompt,
        tools,
        schema,
    })
}
