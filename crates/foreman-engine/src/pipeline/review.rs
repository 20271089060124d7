//! The review loop: alternate implement/iterate prompts with reviewer
//! verdicts over the workspace diff until every reviewer approves or the try
//! budget runs out.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, instrument};

use foreman_core::SchemaBuilder;
use foreman_gateway::ChatResponse;

use crate::error::EngineError;
use crate::pipeline::agent::{self, AgentStep};
use crate::pipeline::StepContext;
use crate::session::PromptRequest;

const FEEDBACK_SEPARATOR: &str = "\n---\n";

/// One compound pipeline step. Prompt names resolve through templates the
/// same way agent steps do, with `feedback` (implement/iterate) and `diff`
/// (review) available as extra attributes.
#[derive(Clone, Debug)]
pub struct ReviewLoop {
    pub name: String,
    pub max_tries: u32,
    pub implement: Vec<String>,
    pub iterate: Vec<String>,
    pub review: Vec<String>,
}

impl ReviewLoop {
    pub fn new(name: impl Into<String>, max_tries: u32) -> Self {
        Self {
            name: name.into(),
            max_tries,
            implement: Vec::new(),
            iterate: Vec::new(),
            review: Vec::new(),
        }
    }

    pub fn implement(mut self, prompts: &[&str]) -> Self {
        self.implement = prompts.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    pub fn iterate(mut self, prompts: &[&str]) -> Self {
        self.iterate = prompts.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    pub fn review(mut self, prompts: &[&str]) -> Self {
        self.review = prompts.iter().map(|p| (*p).to_owned()).collect();
        self
    }
}

#[instrument(skip_all, fields(review_loop = %spec.name))]
pub(crate) async fn run(ctx: &mut StepContext, spec: &ReviewLoop) -> Result<(), EngineError> {
    if spec.implement.is_empty() && spec.iterate.is_empty() {
        return Err(EngineError::Config(format!(
            "review loop {} needs implement or iterate prompts",
            spec.name
        )));
    }

    let reviewer_schema = SchemaBuilder::object()
        .boolean("approved")
        .string("feedback")
        .build();

    let mut tries = 0u32;
    let mut feedbacks: Vec<String> = Vec::new();
    let mut passed = false;

    while tries < spec.max_tries && !passed && !ctx.task().failed() {
        let prompts = if tries == 0 {
            &spec.implement
        } else if spec.iterate.is_empty() {
            &spec.implement
        } else {
            &spec.iterate
        };

        let mut additional = Map::new();
        additional.insert(
            "feedback".to_owned(),
            Value::String(feedbacks.join(FEEDBACK_SEPARATOR)),
        );
        for prompt in prompts {
            agent::run_prompt(ctx, &AgentStep::new(prompt.clone()), &additional).await?;
            if ctx.task().failed() {
                break;
            }
        }

        tries += 1;
        if ctx.task().failed() {
            break;
        }

        feedbacks.clear();
        let diff = ctx.git().diff().await?;

        for reviewer in &spec.review {
            let mut additional = Map::new();
            additional.insert("diff".to_owned(), Value::String(diff.clone()));
            let resolved =
                agent::resolve_prompt(ctx, &AgentStep::new(reviewer.clone()), &additional)?;
            let prompt = resolved.prompt.ok_or_else(|| {
                EngineError::Config(format!("reviewer {reviewer} resolved no prompt"))
            })?;

            let request = PromptRequest::new(prompt)
                .cached_prompt(resolved.cached_prompt)
                .tools(resolved.tools)
                .schema(reviewer_schema.clone())
                .workspace_dir(ctx.workspace().dir.clone());
            let session = Arc::clone(ctx.session());
            let (chat_id, response) = session.prompt_on(ctx.conn(), request).await?;
            ctx.append_chat_id(chat_id.as_str())?;

            match response {
                ChatResponse::Error { error_message } => {
                    ctx.fail(&error_message)?;
                    break;
                }
                ChatResponse::Success { data } => {
                    let approved = data.get("approved").and_then(Value::as_bool).unwrap_or(false);
                    if !approved {
                        let feedback = data
                            .get("feedback")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        feedbacks.push(feedback.to_owned());
                    }
                }
            }
        }

        // The review trail is recorded even when a reviewer failed the task
        // mid-loop; only the loop condition checks the failure.
        add_review(ctx, &diff, &feedbacks)?;
        passed = feedbacks.is_empty();
        info!(tries, passed, open_feedback = feedbacks.len(), "review round finished");
    }

    Ok(())
}

/// Append `{diff, feedbacks}` to the record's review trail, when the record
/// declares one.
fn add_review(ctx: &mut StepContext, diff: &str, feedbacks: &[String]) -> Result<(), EngineError> {
    let supports_reviews = ctx
        .record_handle()
        .map(|handle| handle.decl().reviews)
        .unwrap_or(false);
    if !supports_reviews {
        return Ok(());
    }

    let mut reviews = ctx
        .record()
        .and_then(|record| record.get("reviews").cloned())
        .unwrap_or_else(|| Value::Array(Vec::new()));
    if !reviews.is_array() {
        reviews = Value::Array(Vec::new());
    }
    if let Some(entries) = reviews.as_array_mut() {
        entries.push(json!({ "diff": diff, "feedbacks": feedbacks }));
    }

    let mut values = Map::new();
    values.insert("reviews".to_owned(), reviews);
    ctx.update_record(values)
}
