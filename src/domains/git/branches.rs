use super::service::WorkspaceError;
use git2::{BranchType, Commit, ErrorCode, Reference, Repository};

pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty() && Reference::is_valid_name(&format!("refs/heads/{name}"))
}

/// True when `branch` exists locally or as `origin/<branch>`.
pub fn branch_taken(repo: &Repository, branch: &str) -> bool {
    repo.find_branch(branch, BranchType::Local).is_ok()
        || repo
            .find_branch(&format!("origin/{branch}"), BranchType::Remote)
            .is_ok()
}

/// Resolves a branch, tag or SHA, preferring the freshly fetched `origin/<ref>`.
pub fn resolve_commitish<'r>(
    repo: &'r Repository,
    commitish: &str,
) -> Result<Commit<'r>, WorkspaceError> {
    let trimmed = commitish.trim();
    let failed = |message: String| WorkspaceError::CommitResolution {
        commitish: trimmed.to_string(),
        message,
    };
    if trimmed.is_empty() {
        return Err(failed("no commit-ish given".to_string()));
    }

    let remote_ref = format!("refs/remotes/origin/{trimmed}");
    let object = match repo.revparse_single(&remote_ref) {
        Ok(object) => object,
        Err(_) => repo
            .revparse_single(trimmed)
            .map_err(|e| failed(e.message().to_string()))?,
    };
    object
        .peel_to_commit()
        .map_err(|e| failed(format!("does not point to a commit: {}", e.message())))
}

pub fn create_branch(
    repo: &Repository,
    branch: &str,
    commit: &Commit<'_>,
) -> Result<(), WorkspaceError> {
    match repo.branch(branch, commit, false) {
        Ok(_) => Ok(()),
        Err(e) if e.code() == ErrorCode::Exists => {
            Err(WorkspaceError::BranchExists(branch.to_string()))
        }
        Err(e) => Err(WorkspaceError::Materialize(format!(
            "failed to create branch '{branch}': {}",
            e.message()
        ))),
    }
}

/// Best-effort removal used to roll back a failed setup.
pub fn delete_branch(repo: &Repository, branch: &str) {
    let deleted = repo
        .find_branch(branch, BranchType::Local)
        .and_then(|mut b| b.delete());
    if let Err(err) = deleted
        && err.code() != ErrorCode::NotFound
    {
        log::warn!("Failed to roll back branch '{branch}': {}", err.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_rules() {
        for ok in ["my-feature", "fix/login", "feature_2", "v1.2"] {
            assert!(is_valid_branch_name(ok), "{ok} should be valid");
        }
        for bad in ["", "a..b", "has space", "ends.lock", "a~b", "tail/", "x@{y"] {
            assert!(!is_valid_branch_name(bad), "{bad} should be invalid");
        }
    }
}
