pub use super::branches::{branch_taken, is_valid_branch_name, resolve_commitish};
pub use super::operations::{
    DEFAULT_AUTHOR_EMAIL, DEFAULT_AUTHOR_NAME, commit_and_push, ensure_commit_identity,
    has_uncommitted_changes, remove_workspace, repo_info,
};
pub use super::remote::{RemoteAuth, check_repo_url_format, display_remote, repo_cache_name};
pub use super::worktrees::{ProvisionPlan, provision_workspace, workspace_dir};

use crate::events::ProgressSender;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("'{url}' is not a usable repository: {message}")]
    InvalidRepoUrl { url: String, message: String },
    #[error("failed to clone {url}: {message}")]
    CloneFailed { url: String, message: String },
    #[error("failed to fetch {url}: {message}")]
    FetchFailed { url: String, message: String },
    #[error("a workspace already exists at {}", .0.display())]
    WorkspaceExists(PathBuf),
    #[error("branch '{0}' already exists in the repository")]
    BranchExists(String),
    #[error("cannot resolve '{commitish}': {message}")]
    CommitResolution { commitish: String, message: String },
    #[error("failed to prepare workspace: {0}")]
    Materialize(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("push of '{branch}' failed: {message}")]
    PushFailed { branch: String, message: String },
    #[error("failed to remove {}: {message}", .path.display())]
    Cleanup { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: Option<String>,
    pub remote_url: Option<String>,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitOutcome {
    NothingToCommit,
    Pushed { commit: String },
}

#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub repo_url: String,
    pub from_commitish: String,
    pub feature_name: String,
    pub github_token: Option<String>,
}

/// Creates and tears down the per-session checkout.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    fn workspace_path(&self, feature_name: &str) -> PathBuf;

    async fn validate_repo_url(
        &self,
        repo_url: &str,
        github_token: Option<String>,
    ) -> Result<(), WorkspaceError>;

    async fn setup(
        &self,
        request: SetupRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, WorkspaceError>;

    async fn commit_and_push(
        &self,
        workspace: &Path,
        branch: &str,
        message: &str,
        github_token: Option<String>,
    ) -> Result<CommitOutcome, WorkspaceError>;

    async fn cleanup(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    async fn repo_info(&self, workspace: &Path) -> Result<RepoInfo, WorkspaceError>;
}

/// libgit2-backed provisioner: one bare cache per repository under `repos/`,
/// one workspace per feature under `worktrees/`.
pub struct GitWorkspaceProvisioner {
    repos_dir: PathBuf,
    worktrees_dir: PathBuf,
    repo_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GitWorkspaceProvisioner {
    pub fn new(repos_dir: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            repo_locks: DashMap::new(),
        }
    }

    pub fn cache_dir(&self, repo_url: &str) -> PathBuf {
        self.repos_dir.join(repo_cache_name(repo_url))
    }

    fn repo_lock(&self, cache_name: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(cache_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, WorkspaceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WorkspaceError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkspaceError::Io(std::io::Error::other(format!("git task failed: {e}"))))?
}

#[async_trait]
impl WorkspaceProvisioner for GitWorkspaceProvisioner {
    fn workspace_path(&self, feature_name: &str) -> PathBuf {
        workspace_dir(&self.worktrees_dir, feature_name)
    }

    async fn validate_repo_url(
        &self,
        repo_url: &str,
        github_token: Option<String>,
    ) -> Result<(), WorkspaceError> {
        check_repo_url_format(repo_url)?;
        let url = repo_url.to_string();
        let auth = RemoteAuth::new(github_token, CancellationToken::new());
        let refs = run_blocking(move || super::remote::count_remote_refs(&url, &auth)).await?;
        log::debug!("{} advertises {refs} refs", display_remote(repo_url));
        Ok(())
    }

    async fn setup(
        &self,
        request: SetupRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, WorkspaceError> {
        check_repo_url_format(&request.repo_url)?;
        let workspace = self.workspace_path(&request.feature_name);
        if workspace.exists() {
            return Err(WorkspaceError::WorkspaceExists(workspace));
        }

        let cache_name = repo_cache_name(&request.repo_url);
        let lock = self.repo_lock(&cache_name);
        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            _ = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
        };

        let plan = ProvisionPlan {
            cache_dir: self.repos_dir.join(&cache_name),
            repo_url: request.repo_url,
            from_commitish: request.from_commitish,
            branch: request.feature_name,
            workspace,
        };
        let auth = RemoteAuth::new(request.github_token, cancel);
        run_blocking(move || provision_workspace(&plan, &auth, &progress)).await
    }

    async fn commit_and_push(
        &self,
        workspace: &Path,
        branch: &str,
        message: &str,
        github_token: Option<String>,
    ) -> Result<CommitOutcome, WorkspaceError> {
        let workspace = workspace.to_path_buf();
        let branch = branch.to_string();
        let message = message.to_string();
        let auth = RemoteAuth::new(github_token, CancellationToken::new());
        run_blocking(move || commit_and_push(&workspace, &branch, &message, &auth)).await
    }

    async fn cleanup(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        let workspace = workspace.to_path_buf();
        run_blocking(move || remove_workspace(&workspace)).await
    }

    async fn repo_info(&self, workspace: &Path) -> Result<RepoInfo, WorkspaceError> {
        let workspace = workspace.to_path_buf();
        run_blocking(move || repo_info(&workspace)).await
    }
}
