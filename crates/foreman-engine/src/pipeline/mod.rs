//! Pipeline runtime: a named, ordered sequence of steps a task advances
//! through. Each step runs inside its own store transaction, records itself
//! in `completed_steps` on success, and can fail the task, rewind to an
//! earlier step, or hand control to an agent exchange.

pub mod agent;
pub mod review;

use std::sync::Arc;

use futures::future::LocalBoxFuture;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use foreman_core::Git;
use foreman_store::records::{Record, RecordHandle};
use foreman_store::tasks::{TaskRepo, TaskRow};
use foreman_store::workspaces::{WorkspaceRepo, WorkspaceRow};
use foreman_store::{Store, StoreTx};

use crate::error::EngineError;
use crate::session::Session;
pub use agent::AgentStep;
pub use review::ReviewLoop;

/// A step body owns its context for the duration of the step and hands it
/// back on success. Returning `Err` drops the context, which rolls the step's
/// transaction back.
pub type StepFn =
    Arc<dyn Fn(StepContext) -> LocalBoxFuture<'static, Result<StepContext, EngineError>>>;

/// Failure hooks run inside the failing transaction, in declaration order.
pub type FailureHook = Arc<dyn Fn(&mut StepContext) -> Result<(), EngineError>>;

/// Everything a step body can reach. Owns the open transaction for the step,
/// so every mutation made through it lands in the same commit (and the same
/// version snapshot).
pub struct StepContext {
    tx: StoreTx,
    task: TaskRow,
    record: Option<Record>,
    record_handle: Option<RecordHandle>,
    workspace: WorkspaceRow,
    session: Arc<Session>,
    git: Arc<dyn Git>,
    rewind: Option<String>,
}

impl StepContext {
    pub fn conn(&self) -> &Connection {
        self.tx.conn()
    }

    pub fn task(&self) -> &TaskRow {
        &self.task
    }

    pub fn record(&self) -> Option<&Record> {
        self.record.as_ref()
    }

    pub fn record_handle(&self) -> Option<&RecordHandle> {
        self.record_handle.as_ref()
    }

    pub fn workspace(&self) -> &WorkspaceRow {
        &self.workspace
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn git(&self) -> &Arc<dyn Git> {
        &self.git
    }

    /// Mark the task failed with a message. The pipeline loop stops after the
    /// current step commits.
    pub fn fail(&mut self, message: &str) -> Result<(), EngineError> {
        TaskRepo::fail(self.tx.conn(), self.task.id, message)?;
        self.reload_task()
    }

    /// Request a rewind. Truncation happens after the step body returns; the
    /// target must appear exactly once in `completed_steps`.
    pub fn rewind_to(&mut self, step: &str) {
        self.rewind = Some(step.to_owned());
    }

    /// Apply attribute updates to the task's record.
    pub fn update_record(&mut self, values: Map<String, Value>) -> Result<(), EngineError> {
        let handle = self
            .record_handle
            .as_ref()
            .ok_or_else(|| EngineError::Config("task has no record to update".into()))?;
        let record = self
            .record
            .as_ref()
            .ok_or_else(|| EngineError::Config("task has no record to update".into()))?;
        let updated = handle.update(self.tx.conn(), record.id, values)?;
        self.record = Some(updated);
        Ok(())
    }

    pub(crate) fn append_chat_id(&mut self, chat_id: &str) -> Result<(), EngineError> {
        TaskRepo::append_chat_id(self.tx.conn(), self.task.id, chat_id)?;
        self.reload_task()
    }

    pub(crate) fn reload_task(&mut self) -> Result<(), EngineError> {
        self.task = TaskRepo::find(self.tx.conn(), self.task.id)?;
        Ok(())
    }

    fn into_parts(self) -> (StoreTx, TaskRow, Option<String>) {
        (self.tx, self.task, self.rewind)
    }
}

enum StepBody {
    Plain(StepFn),
    Agent(AgentStep),
    Review(ReviewLoop),
}

struct Step {
    name: String,
    body: StepBody,
}

/// A named pipeline family: ordered steps plus on-failure hooks. The name
/// doubles as the record type the pipeline operates on and the handler name
/// it is registered under.
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
    on_failure: Vec<FailureHook>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("name", &self.name).finish()
    }
}

pub struct PipelineBuilder {
    name: String,
    steps: Vec<Step>,
    on_failure: Vec<FailureHook>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

impl PipelineBuilder {
    pub fn step<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(StepContext) -> LocalBoxFuture<'static, Result<StepContext, EngineError>> + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            body: StepBody::Plain(Arc::new(body)),
        });
        self
    }

    pub fn agent_step(mut self, spec: AgentStep) -> Self {
        self.steps.push(Step {
            name: spec.name.clone(),
            body: StepBody::Agent(spec),
        });
        self
    }

    pub fn agent_review_loop(mut self, spec: ReviewLoop) -> Self {
        self.steps.push(Step {
            name: spec.name.clone(),
            body: StepBody::Review(spec),
        });
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut StepContext) -> Result<(), EngineError> + 'static,
    {
        self.on_failure.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Pipeline, EngineError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.clone()) {
                return Err(EngineError::Config(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
            if let StepBody::Review(spec) = &step.body {
                if spec.implement.is_empty() && spec.iterate.is_empty() {
                    return Err(EngineError::Config(format!(
                        "review loop {} needs implement or iterate prompts",
                        spec.name
                    )));
                }
            }
        }
        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
            on_failure: self.on_failure,
        })
    }
}

impl Pipeline {
    /// Advance the task through its remaining steps. Steps already present in
    /// `completed_steps` are skipped, which is what makes a crashed run
    /// resumable. Generic step failures are recorded on the task and do not
    /// propagate; a cost abort is recorded and then re-raised.
    #[instrument(skip_all, fields(pipeline = %self.name, task_id = task_id))]
    pub async fn call(
        &self,
        task_id: i64,
        store: &Store,
        session: &Arc<Session>,
        git: &Arc<dyn Git>,
    ) -> Result<(), EngineError> {
        info!("pipeline start");
        let task = store
            .with_conn(move |conn| TaskRepo::find(conn, task_id))
            .await?;
        let Some(workspace_id) = task.workspace_id else {
            return Err(EngineError::Config(format!(
                "task {task_id} is not bound to a workspace"
            )));
        };
        let workspace = store
            .with_conn(move |conn| WorkspaceRepo::find(conn, workspace_id))
            .await?;
        if !task.pending() {
            // Done tasks are a no-op; failed tasks are terminal unless
            // explicitly reset by the caller.
            return Ok(());
        }

        loop {
            let task = store
                .with_conn(move |conn| TaskRepo::find(conn, task_id))
                .await?;
            if !task.pending() {
                break;
            }
            let Some(step) = self
                .steps
                .iter()
                .find(|s| !task.completed_steps.contains(&s.name))
            else {
                break;
            };

            if let Err(error) = self
                .run_step(step, task_id, &workspace, store, session, git)
                .await
            {
                warn!(step = %step.name, error = %error, "step failed");
                self.record_failure(task_id, &error, &workspace, store, session, git)
                    .await?;
                if error.cost_abort().is_some() {
                    return Err(error);
                }
                return Ok(());
            }
        }

        store
            .transaction(move |conn| {
                let task = TaskRepo::find(conn, task_id)?;
                if task.pending() {
                    TaskRepo::mark_done(conn, task_id)?;
                }
                Ok(())
            })
            .await?;
        info!("pipeline finished");
        Ok(())
    }

    /// One step inside one transaction: body, then failure hooks / rewind
    /// truncation / completed-step append, then commit. An `Err` from the
    /// body has already rolled back by dropping the context.
    async fn run_step(
        &self,
        step: &Step,
        task_id: i64,
        workspace: &WorkspaceRow,
        store: &Store,
        session: &Arc<Session>,
        git: &Arc<dyn Git>,
    ) -> Result<(), EngineError> {
        info!(step = %step.name, "step start");
        let tx = store.begin().await?;
        let task = TaskRepo::find(tx.conn(), task_id)?;
        let (record, record_handle) = load_record(store, tx.conn(), &task)?;
        let ctx = StepContext {
            tx,
            task,
            record,
            record_handle,
            workspace: workspace.clone(),
            session: Arc::clone(session),
            git: Arc::clone(git),
            rewind: None,
        };

        let mut ctx = match &step.body {
            StepBody::Plain(f) => f(ctx).await?,
            StepBody::Agent(spec) => {
                let mut ctx = ctx;
                agent::run(&mut ctx, spec).await?;
                ctx
            }
            StepBody::Review(spec) => {
                let mut ctx = ctx;
                review::run(&mut ctx, spec).await?;
                ctx
            }
        };

        if ctx.task.failed() {
            self.run_failure_hooks(&mut ctx);
        }

        let (tx, task, rewind) = ctx.into_parts();

        if task.failed() {
            tx.commit()?;
            return Ok(());
        }
        if let Some(target) = rewind {
            let matches = task
                .completed_steps
                .iter()
                .filter(|s| **s == target)
                .count();
            if matches != 1 {
                tx.rollback();
                return Err(EngineError::Rewind {
                    target,
                    detail: format!(
                        "appears {matches} times in completed steps {:?}",
                        task.completed_steps
                    ),
                });
            }
            let cut = task
                .completed_steps
                .iter()
                .position(|s| *s == target)
                .unwrap_or(0);
            TaskRepo::set_completed_steps(tx.conn(), task.id, &task.completed_steps[..cut])?;
            info!(target = %target, "rewound");
        } else {
            TaskRepo::append_completed_step(tx.conn(), task.id, &step.name)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The generic rescue: mark the task failed with the error's kind and
    /// message, then run failure hooks, all in a fresh transaction.
    async fn record_failure(
        &self,
        task_id: i64,
        error: &EngineError,
        workspace: &WorkspaceRow,
        store: &Store,
        session: &Arc<Session>,
        git: &Arc<dyn Git>,
    ) -> Result<(), EngineError> {
        let tx = store.begin().await?;
        TaskRepo::fail(
            tx.conn(),
            task_id,
            &format!("{}: {error}", error.kind_name()),
        )?;
        let task = TaskRepo::find(tx.conn(), task_id)?;
        let (record, record_handle) = load_record(store, tx.conn(), &task)?;
        let mut ctx = StepContext {
            tx,
            task,
            record,
            record_handle,
            workspace: workspace.clone(),
            session: Arc::clone(session),
            git: Arc::clone(git),
            rewind: None,
        };
        self.run_failure_hooks(&mut ctx);
        let (tx, _, _) = ctx.into_parts();
        tx.commit()?;
        Ok(())
    }

    /// Failure hooks run in declaration order; their own errors are absorbed
    /// into the task's error message.
    fn run_failure_hooks(&self, ctx: &mut StepContext) {
        for hook in &self.on_failure {
            if let Err(hook_error) = hook(ctx) {
                warn!(error = %hook_error, "on_failure hook errored");
                let existing = ctx.task.error_message.clone().unwrap_or_default();
                let message = format!("{existing}; on_failure: {hook_error}");
                if TaskRepo::fail(ctx.conn(), ctx.task.id, &message).is_ok() {
                    let _ = ctx.reload_task();
                }
            }
        }
    }
}

fn load_record(
    store: &Store,
    conn: &Connection,
    task: &TaskRow,
) -> Result<(Option<Record>, Option<RecordHandle>), EngineError> {
    match (&task.record_type, task.record_id) {
        (Some(record_type), Some(record_id)) => {
            let handle = store.records(record_type)?;
            let record = handle.find(conn, record_id)?;
            Ok((Some(record), Some(handle)))
        }
        _ => Ok((None, None)),
    }
}
