//! The session: immutable run configuration, the LLM transport seam, tool
//! resolution, spend gating, and the structured `prompt` operation that the
//! pipeline's agent steps are built on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{info, instrument, warn};

use foreman_core::chat::BackendError;
use foreman_core::cost::{CostExceeded, CostOracle, CostTotals, CostType};
use foreman_core::ids::ChatId;
use foreman_core::templates::Templates;
use foreman_core::tools::ToolArgs;
use foreman_core::ChatBackend;
use foreman_gateway::{result_envelope, ChatClient, ChatResponse, GatewayError};
use foreman_store::chats::ChatRepo;
use foreman_store::Store;

use crate::error::EngineError;
use crate::registry::{ToolFactory, ToolRegistry, ToolSpec};

/// Creates one conversation per structured prompt. The vendor adapter behind
/// this seam owns authentication, system prompts, and the tool loop.
pub trait ChatTransport {
    fn create_chat(&self, cached_prompt: &[String]) -> Arc<dyn ChatBackend>;
}

impl<F> ChatTransport for F
where
    F: Fn(&[String]) -> Arc<dyn ChatBackend>,
{
    fn create_chat(&self, cached_prompt: &[String]) -> Arc<dyn ChatBackend> {
        self(cached_prompt)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub project: String,
    /// Distinguishes runs within a project; defaults to the current unix
    /// second.
    pub run_id: String,
    /// Default directory injected into tools that were not given one.
    pub workspace_dir: PathBuf,
    /// Model name recorded on chat-audit rows.
    pub model: Option<String>,
    pub max_spend_project: Option<f64>,
    pub max_spend_run: Option<f64>,
}

impl SessionConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            run_id: Utc::now().timestamp().to_string(),
            workspace_dir: PathBuf::from("."),
            model: None,
            max_spend_project: None,
            max_spend_run: None,
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_spend_project(mut self, dollars: f64) -> Self {
        self.max_spend_project = Some(dollars);
        self
    }

    pub fn max_spend_run(mut self, dollars: f64) -> Self {
        self.max_spend_run = Some(dollars);
        self
    }
}

/// One structured exchange: prompt lines, optional success schema, tools to
/// bind, and the confirmation budget.
pub struct PromptRequest {
    pub prompt: Vec<String>,
    pub cached_prompt: Vec<String>,
    pub schema: Option<Value>,
    pub tools: Vec<ToolSpec>,
    pub tool_args: ToolArgs,
    pub workspace_dir: Option<PathBuf>,
    pub confirm: u32,
    pub out_of: u32,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: vec![prompt.into()],
            cached_prompt: Vec::new(),
            schema: None,
            tools: Vec::new(),
            tool_args: ToolArgs::new(),
            workspace_dir: None,
            confirm: 1,
            out_of: 1,
        }
    }

    pub fn lines(prompt: Vec<String>) -> Self {
        let mut request = Self::new("");
        request.prompt = prompt;
        request
    }

    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn cached_prompt(mut self, cached: Vec<String>) -> Self {
        self.cached_prompt = cached;
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    pub fn confirm(mut self, confirm: u32, out_of: u32) -> Self {
        self.confirm = confirm;
        self.out_of = out_of;
        self
    }
}

pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn ChatTransport>,
    oracle: Arc<dyn CostOracle>,
    templates: Arc<dyn Templates>,
    extra_tools: ToolRegistry,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn ChatTransport>,
        oracle: Arc<dyn CostOracle>,
        templates: Arc<dyn Templates>,
    ) -> Self {
        Self {
            config,
            transport,
            oracle,
            templates,
            extra_tools: ToolRegistry::new(),
        }
    }

    pub fn register_tool(&mut self, name: impl Into<String>, factory: ToolFactory) {
        self.extra_tools.register(name, factory);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn templates(&self) -> &Arc<dyn Templates> {
        &self.templates
    }

    /// Current spend totals from the cost oracle.
    pub async fn current_cost(&self) -> Result<CostTotals, EngineError> {
        self.oracle
            .cost(&self.config.project, &self.config.run_id)
            .await
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Run one structured exchange, auditing the chat and its messages on the
    /// given connection (so a surrounding transaction captures them). Every
    /// gateway failure is folded into an error response; only a cost abort
    /// escapes as an error.
    #[instrument(skip_all, fields(project = %self.config.project, run_id = %self.config.run_id))]
    pub async fn prompt_on(
        &self,
        conn: &Connection,
        request: PromptRequest,
    ) -> Result<(ChatId, ChatResponse), EngineError> {
        let backend = self.transport.create_chat(&request.cached_prompt);
        self.install_spend_gate(&backend);

        let workspace_dir = request
            .workspace_dir
            .clone()
            .unwrap_or_else(|| self.config.workspace_dir.clone());
        let tools = self.resolve_tools(&request.tools, &request.tool_args, &workspace_dir)?;
        if !tools.is_empty() {
            backend.with_tools(tools);
        }

        let chat_id = backend.id();
        ChatRepo::create_chat(
            conn,
            chat_id.as_str(),
            &self.config.project,
            &self.config.run_id,
            self.config.model.as_deref(),
        )?;
        info!(chat_id = %chat_id, "chat created");

        let prompt_text = request.prompt.join("\n");
        let envelope = result_envelope(request.schema.as_ref());
        let client = ChatClient::new(Arc::clone(&backend));
        let outcome = client
            .get(
                &prompt_text,
                envelope.as_ref(),
                request.confirm,
                request.out_of,
            )
            .await;

        for message in backend.messages() {
            ChatRepo::append_message(conn, chat_id.as_str(), &message)?;
        }

        let response = match outcome {
            Ok(answer) => ChatResponse::from_answer(answer),
            Err(GatewayError::Aborted(cost)) => return Err(EngineError::Aborted(cost)),
            Err(e) => {
                warn!(error = %e, "prompt failed, returning error response");
                ChatResponse::error(format!("{}: {e}", e.error_kind()))
            }
        };
        Ok((chat_id, response))
    }

    /// Standalone variant opening its own transaction.
    pub async fn prompt(
        &self,
        store: &Store,
        request: PromptRequest,
    ) -> Result<(ChatId, ChatResponse), EngineError> {
        let tx = store.begin().await?;
        match self.prompt_on(tx.conn(), request).await {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    fn resolve_tools(
        &self,
        specs: &[ToolSpec],
        tool_args: &ToolArgs,
        workspace_dir: &Path,
    ) -> Result<Vec<Arc<dyn foreman_core::Tool>>, EngineError> {
        // Built-ins come from outside the core; the session only contributes
        // its extras.
        let registry = ToolRegistry::new().merged(&self.extra_tools);
        specs
            .iter()
            .map(|spec| registry.resolve(spec, tool_args, workspace_dir))
            .collect()
    }

    /// After every model reply, compare oracle totals against the configured
    /// thresholds and abort the exchange when one is reached.
    fn install_spend_gate(&self, backend: &Arc<dyn ChatBackend>) {
        let (max_project, max_run) = (self.config.max_spend_project, self.config.max_spend_run);
        if max_project.is_none() && max_run.is_none() {
            return;
        }
        let oracle = Arc::clone(&self.oracle);
        let project = self.config.project.clone();
        let run_id = self.config.run_id.clone();
        backend.on_end_message(Arc::new(move |_message| {
            let oracle = Arc::clone(&oracle);
            let project = project.clone();
            let run_id = run_id.clone();
            Box::pin(async move {
                let totals = oracle
                    .cost(&project, &run_id)
                    .await
                    .map_err(|e| BackendError::Transport(e.to_string()))?;
                if let Some(threshold) = max_project {
                    if totals.project >= threshold {
                        return Err(BackendError::Aborted(CostExceeded {
                            cost_type: CostType::Project,
                            current_cost: totals.project,
                            threshold,
                        }));
                    }
                }
                if let Some(threshold) = max_run {
                    if totals.run >= threshold {
                        return Err(BackendError::Aborted(CostExceeded {
                            cost_type: CostType::Run,
                            current_cost: totals.run,
                            threshold,
                        }));
                    }
                }
                Ok(())
            })
        }));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("project", &self.config.project)
            .field("run_id", &self.config.run_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::cost::FixedCostOracle;
    use foreman_core::templates::StaticTemplates;
    use foreman_gateway::SharedScript;
    use foreman_store::StoreConfig;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("foreman-session-{}", uuid::Uuid::now_v7()))
    }

    async fn store(dir: &Path) -> Store {
        Store::open(StoreConfig::new(dir)).await.unwrap()
    }

    fn session(script: &SharedScript, config: SessionConfig) -> Session {
        let script = script.clone();
        let transport = move |_cached: &[String]| {
            Arc::new(script.backend()) as Arc<dyn ChatBackend>
        };
        Session::new(
            config,
            Arc::new(transport),
            FixedCostOracle::new(0.0, 0.0),
            Arc::new(StaticTemplates::default()),
        )
    }

    fn title_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"],
            "additionalProperties": false,
        })
    }

    #[tokio::test]
    async fn prompt_success_audits_chat_and_messages() {
        let dir = temp_dir();
        let store = store(&dir).await;
        let script = SharedScript::with_replies(vec![r#"{"title": "Hi"}"#.into()]);
        let session = session(&script, SessionConfig::new("blog").run_id("r1").model("sonnet"));

        let (chat_id, response) = session
            .prompt(&store, PromptRequest::new("write").schema(title_schema()))
            .await
            .unwrap();
        assert!(response.success());
        assert_eq!(response.data().unwrap()["title"], "Hi");

        let chat = store
            .with_conn(|conn| ChatRepo::find_chat(conn, chat_id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat.project.as_deref(), Some("blog"));
        assert_eq!(chat.run_id.as_deref(), Some("r1"));
        assert!(chat.model_id.is_some());

        let messages = store
            .with_conn(|conn| ChatRepo::messages(conn, chat_id.as_str()))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn error_branch_becomes_error_response() {
        let dir = temp_dir();
        let store = store(&dir).await;
        let script = SharedScript::with_replies(vec![
            r#"{"unable_to_fulfill_request_error": "no tests in repo"}"#.into(),
        ]);
        let session = session(&script, SessionConfig::new("blog"));

        let (_, response) = session
            .prompt(&store, PromptRequest::new("fix tests").schema(title_schema()))
            .await
            .unwrap();
        assert!(!response.success());
        assert_eq!(response.error_message(), Some("no tests in repo"));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn gateway_failure_is_captured_not_raised() {
        let dir = temp_dir();
        let store = store(&dir).await;
        // Script exhausted immediately → backend transport error.
        let script = SharedScript::with_replies(vec![]);
        let session = session(&script, SessionConfig::new("blog"));

        let (_, response) = session
            .prompt(&store, PromptRequest::new("anything"))
            .await
            .unwrap();
        assert!(!response.success());
        assert!(response.error_message().unwrap().starts_with("backend:"));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn spend_abort_is_raised_with_exact_message() {
        let dir = temp_dir();
        let store = store(&dir).await;
        let script = SharedScript::with_replies(vec![r#"{"title": "x"}"#.into()]);

        let script_for_transport = script.clone();
        let transport = move |_cached: &[String]| {
            Arc::new(script_for_transport.backend()) as Arc<dyn ChatBackend>
        };
        let session = Session::new(
            SessionConfig::new("blog").max_spend_project(1.0),
            Arc::new(transport),
            FixedCostOracle::new(1.8, 0.0),
            Arc::new(StaticTemplates::default()),
        );

        let err = session
            .prompt(&store, PromptRequest::new("write"))
            .await
            .unwrap_err();
        let cost = err.cost_abort().expect("expected cost abort");
        assert_eq!(cost.cost_type, CostType::Project);
        assert_eq!(
            err.to_string(),
            "Abort: project cost $1.80 exceeds threshold $1.00"
        );

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn run_spend_limit_gates_too() {
        let dir = temp_dir();
        let store = store(&dir).await;
        let script = SharedScript::with_replies(vec![r#"{"title": "x"}"#.into()]);
        let script_for_transport = script.clone();
        let transport = move |_cached: &[String]| {
            Arc::new(script_for_transport.backend()) as Arc<dyn ChatBackend>
        };
        let session = Session::new(
            SessionConfig::new("blog").max_spend_run(0.5),
            Arc::new(transport),
            FixedCostOracle::new(0.0, 0.75),
            Arc::new(StaticTemplates::default()),
        );

        let err = session
            .prompt(&store, PromptRequest::new("write"))
            .await
            .unwrap_err();
        assert_eq!(err.cost_abort().unwrap().cost_type, CostType::Run);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_tool_propagates_as_config_error() {
        let dir = temp_dir();
        let store = store(&dir).await;
        let script = SharedScript::with_replies(vec![r#"{"title": "x"}"#.into()]);
        let session = session(&script, SessionConfig::new("blog"));

        let err = session
            .prompt(
                &store,
                PromptRequest::new("write").tools(vec![ToolSpec::name("missing")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTool { .. }));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn run_id_defaults_to_unix_second() {
        let config = SessionConfig::new("p");
        let parsed: i64 = config.run_id.parse().unwrap();
        assert!(parsed > 1_600_000_000);
    }
}
