use super::branches::{branch_taken, create_branch, delete_branch, resolve_commitish};
use super::clone::ensure_cached_repo;
use super::remote::RemoteAuth;
use super::service::WorkspaceError;
use crate::events::{ProgressKind, ProgressSender};
use git2::build::CheckoutBuilder;
use git2::{Oid, Repository, ResetType};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub repo_url: String,
    pub from_commitish: String,
    pub branch: String,
    pub cache_dir: PathBuf,
    pub workspace: PathBuf,
}

/// Blocking half of workspace setup. Callers serialize plans that share a cache.
pub fn provision_workspace(
    plan: &ProvisionPlan,
    auth: &RemoteAuth,
    progress: &ProgressSender,
) -> Result<PathBuf, WorkspaceError> {
    auth.ensure_active()?;
    if plan.workspace.exists() {
        return Err(WorkspaceError::WorkspaceExists(plan.workspace.clone()));
    }

    let cache = ensure_cached_repo(&plan.repo_url, &plan.cache_dir, auth, progress)?;
    auth.ensure_active()?;
    if branch_taken(&cache, &plan.branch) {
        return Err(WorkspaceError::BranchExists(plan.branch.clone()));
    }

    progress.send(
        ProgressKind::Resolving,
        format!("Resolving {}", plan.from_commitish),
    );
    let commit = resolve_commitish(&cache, &plan.from_commitish)?;
    let commit_id = commit.id();

    progress.send(
        ProgressKind::Branching,
        format!(
            "Creating branch {} at {}",
            plan.branch,
            short_id(commit_id)
        ),
    );
    create_branch(&cache, &plan.branch, &commit)?;

    progress.send(ProgressKind::Materializing, "Preparing workspace");
    let materialized = auth
        .ensure_active()
        .and_then(|()| materialize(&cache, plan, commit_id));
    if let Err(err) = materialized {
        if let Err(cleanup) = fs::remove_dir_all(&plan.workspace)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!(
                "Failed to remove partial workspace {}: {cleanup}",
                plan.workspace.display()
            );
        }
        delete_branch(&cache, &plan.branch);
        return Err(err);
    }

    progress.send(
        ProgressKind::WorkspaceReady,
        format!("Workspace ready on branch {}", plan.branch),
    );
    Ok(plan.workspace.clone())
}

/// Exports the commit's tree into the workspace, then gives the workspace its
/// own git directory holding only the new branch, with `origin` pointing at the
/// real remote.
fn materialize(cache: &Repository, plan: &ProvisionPlan, commit_id: Oid) -> Result<(), WorkspaceError> {
    let failed = |step: &str, e: git2::Error| {
        WorkspaceError::Materialize(format!("{step}: {}", e.message()))
    };

    fs::create_dir_all(&plan.workspace)?;

    let tree = cache
        .find_commit(commit_id)
        .and_then(|c| c.tree())
        .map_err(|e| failed("reading commit tree", e))?;
    let mut checkout = CheckoutBuilder::new();
    checkout
        .target_dir(&plan.workspace)
        .force()
        .recreate_missing(true)
        .update_index(false);
    cache
        .checkout_tree(tree.as_object(), Some(&mut checkout))
        .map_err(|e| failed("exporting files", e))?;

    let repo = Repository::init(&plan.workspace).map_err(|e| failed("initializing git", e))?;
    let cache_location = plan.cache_dir.to_string_lossy();
    let mut seed = repo
        .remote_anonymous(&cache_location)
        .map_err(|e| failed("opening cache", e))?;
    let refspec = format!("+refs/heads/{0}:refs/heads/{0}", plan.branch);
    seed.fetch(&[refspec.as_str()], None, None)
        .map_err(|e| failed("seeding history", e))?;

    repo.set_head(&format!("refs/heads/{}", plan.branch))
        .map_err(|e| failed("setting HEAD", e))?;
    let target = repo
        .find_object(commit_id, None)
        .map_err(|e| failed("locating commit", e))?;
    repo.reset(&target, ResetType::Mixed, None)
        .map_err(|e| failed("building index", e))?;
    repo.remote("origin", plan.repo_url.trim())
        .map_err(|e| failed("configuring origin", e))?;
    Ok(())
}

fn short_id(oid: Oid) -> String {
    oid.to_string().chars().take(8).collect()
}

pub fn workspace_dir(worktrees_dir: &Path, feature_name: &str) -> PathBuf {
    worktrees_dir.join(feature_name)
}
