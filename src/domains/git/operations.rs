use super::remote::RemoteAuth;
use super::service::{CommitOutcome, RepoInfo, WorkspaceError};
use git2::{IndexAddOption, PushOptions, Repository, Signature, StatusOptions};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const DEFAULT_AUTHOR_NAME: &str = "Claude Bot";
pub const DEFAULT_AUTHOR_EMAIL: &str = "claude-bot@example.com";

pub fn has_uncommitted_changes(repo: &Repository) -> Result<bool, git2::Error> {
    let mut options = StatusOptions::new();
    options
        .include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    Ok(!repo.statuses(Some(&mut options))?.is_empty())
}

/// Fills in `user.name`/`user.email` in the repository config when no level
/// provides them, leaving configured values alone.
pub fn ensure_commit_identity(repo: &Repository) -> Result<Signature<'static>, git2::Error> {
    let mut config = repo.config()?;
    let snapshot = config.snapshot()?;
    let has = |key: &str| {
        snapshot
            .get_string(key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    };
    let (has_name, has_email) = (has("user.name"), has("user.email"));
    drop(snapshot);

    if !has_name {
        config.set_str("user.name", DEFAULT_AUTHOR_NAME)?;
    }
    if !has_email {
        config.set_str("user.email", DEFAULT_AUTHOR_EMAIL)?;
    }
    repo.signature()
}

/// Stages everything, commits on the current branch and pushes it to `origin`.
pub fn commit_and_push(
    workspace: &Path,
    branch: &str,
    message: &str,
    auth: &RemoteAuth,
) -> Result<CommitOutcome, WorkspaceError> {
    let commit_failed = |e: git2::Error| WorkspaceError::CommitFailed(e.message().to_string());

    let repo = Repository::open(workspace).map_err(commit_failed)?;
    if !has_uncommitted_changes(&repo).map_err(commit_failed)? {
        log::info!("No changes to commit in {}", workspace.display());
        return Ok(CommitOutcome::NothingToCommit);
    }

    let mut index = repo.index().map_err(commit_failed)?;
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .map_err(commit_failed)?;
    index.update_all(["*"].iter(), None).map_err(commit_failed)?;
    index.write().map_err(commit_failed)?;
    let tree = index
        .write_tree()
        .and_then(|oid| repo.find_tree(oid))
        .map_err(commit_failed)?;

    let signature = ensure_commit_identity(&repo).map_err(commit_failed)?;
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<_> = parent.iter().collect();
    let commit = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .map_err(commit_failed)?;
    log::info!("Committed {commit} on '{branch}' in {}", workspace.display());

    push_branch(&repo, branch, auth)?;
    Ok(CommitOutcome::Pushed {
        commit: commit.to_string(),
    })
}

fn push_branch(repo: &Repository, branch: &str, auth: &RemoteAuth) -> Result<(), WorkspaceError> {
    let failed = |message: String| WorkspaceError::PushFailed {
        branch: branch.to_string(),
        message,
    };
    auth.ensure_active()?;

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| failed(e.message().to_string()))?;
    let mut callbacks = auth.callbacks();
    callbacks.push_update_reference(|refname, status| match status {
        Some(reason) => Err(git2::Error::from_str(&format!(
            "{refname} rejected: {reason}"
        ))),
        None => Ok(()),
    });
    let mut options = PushOptions::new();
    options.remote_callbacks(callbacks);

    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut options))
        .map_err(|e| auth.network_error(e, failed))?;
    log::info!("Pushed '{branch}' to origin");
    Ok(())
}

pub fn repo_info(workspace: &Path) -> Result<RepoInfo, WorkspaceError> {
    let repo = Repository::open(workspace)
        .map_err(|e| WorkspaceError::Materialize(e.message().to_string()))?;
    let head = repo.head().ok();
    let branch = head
        .as_ref()
        .filter(|h| h.is_branch())
        .and_then(|h| h.shorthand().map(str::to_string));
    let head_commit = head
        .as_ref()
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| c.id().to_string());
    let remote_url = repo
        .find_remote("origin")
        .ok()
        .and_then(|r| r.url().map(str::to_string));
    let is_dirty = has_uncommitted_changes(&repo)
        .map_err(|e| WorkspaceError::Materialize(e.message().to_string()))?;

    Ok(RepoInfo {
        path: workspace.to_path_buf(),
        branch,
        head_commit,
        remote_url,
        is_dirty,
    })
}

/// Removes a workspace directory; an absent path counts as removed.
pub fn remove_workspace(workspace: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(workspace) {
        Ok(()) => {
            log::info!("Removed workspace {}", workspace.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::Cleanup {
            path: workspace.to_path_buf(),
            message: e.to_string(),
        }),
    }
}
