//! Shared fixtures for the engine integration suites.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use foreman_core::cost::FixedCostOracle;
use foreman_core::git::{Git, GitError, Revision};
use foreman_core::templates::StaticTemplates;
use foreman_core::ChatBackend;
use foreman_engine::{Session, SessionConfig};
use foreman_gateway::SharedScript;
use foreman_store::workspaces::{WorkspaceRepo, WorkspaceRow};
use foreman_store::{RecordDecl, Store, StoreConfig};

/// Git double: scripted diffs, counted commits, no subprocesses.
#[derive(Default)]
pub struct FakeGit {
    pub diffs: Mutex<VecDeque<String>>,
    pub worktrees: Mutex<Vec<(PathBuf, String, String)>>,
}

impl FakeGit {
    pub fn with_diffs(diffs: Vec<&str>) -> Self {
        Self {
            diffs: Mutex::new(diffs.into_iter().map(str::to_owned).collect()),
            worktrees: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait(?Send)]
impl Git for FakeGit {
    async fn create_worktree(
        &self,
        worktree_dir: &std::path::Path,
        branch: &str,
        revision: &str,
    ) -> Result<(), GitError> {
        self.worktrees
            .lock()
            .push((worktree_dir.to_owned(), branch.to_owned(), revision.to_owned()));
        Ok(())
    }

    async fn diff(&self) -> Result<String, GitError> {
        Ok(self
            .diffs
            .lock()
            .pop_front()
            .unwrap_or_else(|| "fake diff".to_owned()))
    }

    async fn status(&self) -> Result<String, GitError> {
        Ok(String::new())
    }

    async fn commit_all(&self, _message: &str) -> Result<Revision, GitError> {
        Ok("0000000000000000000000000000000000000000".to_owned())
    }

    async fn last_revision(&self) -> Result<Revision, GitError> {
        Ok("0000000000000000000000000000000000000000".to_owned())
    }

    async fn reset_hard_all(&self) -> Result<(), GitError> {
        Ok(())
    }

    async fn uncommitted_changes(&self) -> Result<bool, GitError> {
        Ok(false)
    }
}

pub struct Harness {
    pub dir: PathBuf,
    pub store: Store,
    pub session: Arc<Session>,
    pub script: SharedScript,
    pub oracle: Arc<FixedCostOracle>,
    pub git: Arc<dyn Git>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub struct HarnessOptions {
    pub records: Vec<RecordDecl>,
    pub templates: StaticTemplates,
    pub versioned: bool,
    pub max_spend_project: Option<f64>,
    pub project_cost: f64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            records: vec![RecordDecl::new("post").text("attr").with_reviews()],
            templates: StaticTemplates::default(),
            versioned: false,
            max_spend_project: None,
            project_cost: 0.0,
        }
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
    let dir = std::env::temp_dir().join(format!("foreman-e2e-{}", uuid::Uuid::now_v7()));
    let mut config = StoreConfig::new(&dir).versioned(options.versioned);
    for record in options.records {
        config = config.record(record);
    }
    let store = Store::open(config).await.unwrap();

    let script = SharedScript::default();
    let oracle = FixedCostOracle::new(options.project_cost, 0.0);

    let mut session_config = SessionConfig::new("e2e").run_id("run-1");
    if let Some(max) = options.max_spend_project {
        session_config = session_config.max_spend_project(max);
    }
    let transport_script = script.clone();
    let transport =
        move |_cached: &[String]| Arc::new(transport_script.backend()) as Arc<dyn ChatBackend>;
    let session = Arc::new(Session::new(
        session_config,
        Arc::new(transport),
        Arc::clone(&oracle) as Arc<dyn foreman_core::CostOracle>,
        Arc::new(options.templates),
    ));

    Harness {
        dir,
        store,
        session,
        script,
        oracle,
        git: Arc::new(FakeGit::default()),
    }
}

pub async fn make_workspace(store: &Store, dir: &str) -> WorkspaceRow {
    let dir = dir.to_owned();
    store
        .transaction(move |conn| WorkspaceRepo::find_or_create(conn, &dir, &HashMap::new()))
        .await
        .unwrap()
}
