//! Thin assembly layer: build (or accept) the store, provision workspaces
//! (directly or as git worktrees), register the pipeline as the single task
//! handler, and render the run report.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use tracing::{info, instrument};

use foreman_core::Git;
use foreman_store::records::Record;
use foreman_store::tasks::{TaskRepo, TaskRow, TaskStatus};
use foreman_store::workspaces::{WorkspaceRepo, WorkspaceRow};
use foreman_store::{Store, StoreConfig};

use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::processor::{AfterEach, Handler, Processor};
use crate::session::Session;

/// Either an opened store or the config to open one with.
pub enum StoreArg {
    Built(Store),
    Config(StoreConfig),
}

impl From<Store> for StoreArg {
    fn from(store: Store) -> Self {
        Self::Built(store)
    }
}

impl From<StoreConfig> for StoreArg {
    fn from(config: StoreConfig) -> Self {
        Self::Config(config)
    }
}

/// A plain directory workspace.
#[derive(Clone, Debug)]
pub struct WorkspaceSpec {
    pub dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl WorkspaceSpec {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: HashMap::new(),
        }
    }
}

/// Worktree provisioning config: one workspace per env entry, branch
/// `<prefix>-<index>`, checked out at `initial_revision`.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    pub worktree_root: PathBuf,
    pub branch_prefix: String,
    pub initial_revision: String,
    pub working_subdir: Option<String>,
    pub worktree_envs: Vec<HashMap<String, String>>,
}

/// `workspace` and `repo` are exclusive ways of saying where tasks run.
pub enum WorkspaceSource {
    Workspaces(Vec<WorkspaceSpec>),
    Repo(RepoConfig),
}

pub struct Batch {
    store: Store,
    session: Arc<Session>,
    pipeline: Arc<Pipeline>,
    processor: Processor,
    workspaces: Vec<WorkspaceRow>,
}

impl Batch {
    #[instrument(skip_all)]
    pub async fn new(
        store: impl Into<StoreArg>,
        session: Arc<Session>,
        git: Arc<dyn Git>,
        pipeline: Pipeline,
        workspaces: WorkspaceSource,
    ) -> Result<Self, EngineError> {
        let store = match store.into() {
            StoreArg::Built(store) => store,
            StoreArg::Config(config) => Store::open(config).await?,
        };

        let specs = match workspaces {
            WorkspaceSource::Workspaces(specs) => specs,
            WorkspaceSource::Repo(config) => {
                provision_worktrees(&store, git.as_ref(), &config).await?
            }
        };
        let rows: Vec<WorkspaceRow> = store
            .transaction(move |conn| {
                specs
                    .iter()
                    .map(|spec| {
                        WorkspaceRepo::find_or_create(
                            conn,
                            &spec.dir.to_string_lossy(),
                            &spec.env,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        let pipeline = Arc::new(pipeline);
        let mut processor = Processor::new(store.clone(), rows.clone());
        let handler: Handler = {
            let pipeline = Arc::clone(&pipeline);
            let store = store.clone();
            let session = Arc::clone(&session);
            let git = Arc::clone(&git);
            Arc::new(move |task: TaskRow| {
                let pipeline = Arc::clone(&pipeline);
                let store = store.clone();
                let session = Arc::clone(&session);
                let git = Arc::clone(&git);
                Box::pin(async move { pipeline.call(task.id, &store, &session, &git).await })
            })
        };
        processor.register_handler(pipeline.name(), handler);

        info!(pipeline = pipeline.name(), workspaces = rows.len(), "batch assembled");
        Ok(Self {
            store,
            session,
            pipeline,
            processor,
            workspaces: rows,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn workspaces(&self) -> &[WorkspaceRow] {
        &self.workspaces
    }

    /// Enqueue (idempotently) one pipeline run for a record.
    pub async fn add_task(&self, record: &Record) -> Result<TaskRow, EngineError> {
        self.processor
            .add_task(self.pipeline.name(), record.id, self.pipeline.name())
            .await
    }

    pub async fn call(&self, after_each: Option<AfterEach>) -> Result<(), EngineError> {
        self.processor.call(after_each).await
    }

    pub fn abort(&self) {
        self.processor.abort();
    }

    /// Deterministic, line-delimited run summary.
    pub async fn report(&self) -> Result<String, EngineError> {
        let stats = self
            .store
            .with_conn(|conn| {
                Ok(ReportStats {
                    total: TaskRepo::count(conn)?,
                    done: TaskRepo::count_by_status(conn, TaskStatus::Done)?,
                    pending: TaskRepo::count_by_status(conn, TaskStatus::Pending)?,
                    failed: TaskRepo::count_by_status(conn, TaskStatus::Failed)?,
                    failed_messages: TaskRepo::failed_messages(conn, 3)?,
                    span: TaskRepo::time_span(conn)?,
                })
            })
            .await?;
        let cost = self.session.current_cost().await?;
        let worktrees = self.workspaces.len() as i64;

        let mut out = String::new();
        let _ = writeln!(out, "Total: {}", stats.total);
        let _ = writeln!(out, "Succeeded: {}", stats.done);
        let _ = writeln!(out, "Pending: {}", stats.pending);
        let _ = writeln!(out, "Failed: {}", stats.failed);

        let mut total_minutes = 0.0;
        if let Some((started, updated)) = &stats.span {
            let seconds = span_seconds(started, updated);
            total_minutes = seconds as f64 / 60.0;
            let _ = writeln!(
                out,
                "Time: {} hrs, {} mins, {} secs",
                seconds / 3600,
                (seconds % 3600) / 60,
                seconds % 60
            );
        }

        let _ = writeln!(out, "Worktrees: {worktrees}");
        let _ = writeln!(out, "Run cost: ${:.2}", cost.run);
        let _ = writeln!(out, "Project total cost: ${:.2}", cost.project);
        if stats.total > 0 {
            let _ = writeln!(
                out,
                "Cost per task: ${:.2}",
                cost.run * worktrees as f64 / stats.total as f64
            );
            let _ = writeln!(
                out,
                "Minutes per task: {:.2}",
                (total_minutes / worktrees as f64) / stats.total as f64
            );
        }

        if stats.failed > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "First {} failed task(s):", stats.failed.min(3));
            for message in &stats.failed_messages {
                let _ = writeln!(out, "- {message}");
            }
        }
        Ok(out)
    }
}

struct ReportStats {
    total: i64,
    done: i64,
    pending: i64,
    failed: i64,
    failed_messages: Vec<String>,
    span: Option<(String, String)>,
}

fn span_seconds(started: &str, updated: &str) -> i64 {
    match (
        DateTime::parse_from_rfc3339(started),
        DateTime::parse_from_rfc3339(updated),
    ) {
        (Ok(start), Ok(end)) => (end - start).num_seconds().max(0),
        _ => 0,
    }
}

/// One worktree per env entry. Creation is skipped when a workspace row for
/// the target dir already exists, so re-assembling a batch is idempotent.
async fn provision_worktrees(
    store: &Store,
    git: &dyn Git,
    config: &RepoConfig,
) -> Result<Vec<WorkspaceSpec>, EngineError> {
    let mut specs = Vec::with_capacity(config.worktree_envs.len());
    for (index, env) in config.worktree_envs.iter().enumerate() {
        let branch = format!("{}-{index}", config.branch_prefix);
        let worktree_dir = config.worktree_root.join(&branch);
        let workspace_dir = match &config.working_subdir {
            Some(subdir) => worktree_dir.join(subdir),
            None => worktree_dir.clone(),
        };

        let dir_string = workspace_dir.to_string_lossy().into_owned();
        let existing = store
            .with_conn(move |conn| WorkspaceRepo::find_by_dir(conn, &dir_string))
            .await?;
        if existing.is_none() {
            git.create_worktree(&worktree_dir, &branch, &config.initial_revision)
                .await?;
            info!(branch = %branch, dir = %worktree_dir.display(), "worktree provisioned");
        }

        specs.push(WorkspaceSpec {
            dir: workspace_dir,
            env: env.clone(),
        });
    }
    Ok(specs)
}
