//! Workspace-partitioned scheduler. One cooperative drain per workspace pulls
//! pending tasks in creation order; an unbound task is claimed (bound to the
//! drain's workspace) in the same transaction that dequeues it. The first
//! drain error aborts the whole set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use foreman_store::tasks::{TaskRepo, TaskRow};
use foreman_store::workspaces::WorkspaceRow;
use foreman_store::Store;

use crate::error::EngineError;

pub type Handler = Arc<dyn Fn(TaskRow) -> LocalBoxFuture<'static, Result<(), EngineError>>>;
pub type AfterEach = Arc<dyn Fn()>;

pub struct Processor {
    store: Store,
    workspaces: Vec<WorkspaceRow>,
    handlers: HashMap<String, Handler>,
    abort: CancellationToken,
}

impl Processor {
    pub fn new(store: Store, workspaces: Vec<WorkspaceRow>) -> Self {
        Self {
            store,
            workspaces,
            handlers: HashMap::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Handler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn workspaces(&self) -> &[WorkspaceRow] {
        &self.workspaces
    }

    /// Request cooperative shutdown. Polled before each dequeue; a running
    /// step is never interrupted.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Find or create the task for `(record, handler)`. Calling this N times
    /// creates exactly one task.
    pub async fn add_task(
        &self,
        record_type: &str,
        record_id: i64,
        handler: &str,
    ) -> Result<TaskRow, EngineError> {
        if !self.handlers.contains_key(handler) {
            return Err(EngineError::UnknownHandler(handler.to_owned()));
        }
        let record_type = record_type.to_owned();
        let handler = handler.to_owned();
        Ok(self
            .store
            .transaction(move |conn| {
                if let Some(existing) = TaskRepo::find_by_record_and_handler(
                    conn,
                    &record_type,
                    record_id,
                    &handler,
                )? {
                    return Ok(existing);
                }
                TaskRepo::create(conn, Some(&record_type), Some(record_id), &handler)
            })
            .await?)
    }

    /// Drain every pending task across the workspace slots. A single
    /// workspace drains synchronously; several drain cooperatively, bounded
    /// by a semaphore as wide as the slot count, and the first error cancels
    /// the rest and is re-raised after all slots settle.
    #[instrument(skip_all, fields(workspaces = self.workspaces.len()))]
    pub async fn call(&self, after_each: Option<AfterEach>) -> Result<(), EngineError> {
        if self.workspaces.is_empty() {
            return Err(EngineError::NoWorkspaces);
        }
        if self.workspaces.len() == 1 {
            return self.drain(&self.workspaces[0], after_each.as_ref()).await;
        }

        let semaphore = Arc::new(Semaphore::new(self.workspaces.len()));
        let first_error: RefCell<Option<EngineError>> = RefCell::new(None);
        let first_error = &first_error;

        let drains = self.workspaces.iter().map(|workspace| {
            let semaphore = Arc::clone(&semaphore);
            let after_each = after_each.clone();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if let Err(error) = self.drain(workspace, after_each.as_ref()).await {
                    warn!(workspace_id = workspace.id, error = %error, "drain failed, aborting set");
                    self.abort.cancel();
                    let mut slot = first_error.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                }
            }
        });
        futures::future::join_all(drains).await;

        let result = match first_error.borrow_mut().take() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        result
    }

    async fn drain(
        &self,
        workspace: &WorkspaceRow,
        after_each: Option<&AfterEach>,
    ) -> Result<(), EngineError> {
        loop {
            if self.abort.is_cancelled() {
                info!(workspace_id = workspace.id, "drain aborted");
                return Ok(());
            }

            let workspace_id = workspace.id;
            let claimed = self
                .store
                .transaction(move |conn| TaskRepo::claim_next_pending(conn, workspace_id))
                .await?;
            let Some(task) = claimed else {
                return Ok(());
            };

            let task_id = task.id;
            let handler = self
                .handlers
                .get(&task.handler)
                .ok_or_else(|| EngineError::UnknownHandler(task.handler.clone()))?;
            info!(task_id, workspace_id, handler = %task.handler, "task start");
            handler(task).await?;

            let after = self
                .store
                .with_conn(move |conn| TaskRepo::find(conn, task_id))
                .await?;
            if after.pending() {
                return Err(EngineError::TaskPending(task_id));
            }

            if let Some(callback) = after_each {
                callback();
            }
        }
    }
}
