use super::remote::{RemoteAuth, display_remote};
use super::service::WorkspaceError;
use crate::events::{ProgressKind, ProgressSender};
use git2::build::RepoBuilder;
use git2::{AutotagOption, FetchOptions, FetchPrune, Repository};
use std::fs;
use std::path::Path;

fn fetch_options(auth: &RemoteAuth) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(auth.callbacks());
    options.download_tags(AutotagOption::All);
    options
}

/// Opens the bare cache for `repo_url` and fetches `origin`, cloning it on first use.
pub fn ensure_cached_repo(
    repo_url: &str,
    cache_dir: &Path,
    auth: &RemoteAuth,
    progress: &ProgressSender,
) -> Result<Repository, WorkspaceError> {
    let display = display_remote(repo_url);

    if cache_dir.exists() {
        match Repository::open_bare(cache_dir) {
            Ok(repo) => {
                progress.send(
                    ProgressKind::OpeningCache,
                    format!("Using cached clone of {display}"),
                );
                progress.send(ProgressKind::Fetching, "Fetching latest changes");
                fetch_origin(&repo, auth, &display)?;
                return Ok(repo);
            }
            Err(err) => {
                log::warn!(
                    "Discarding unusable repository cache {}: {}",
                    cache_dir.display(),
                    err.message()
                );
                fs::remove_dir_all(cache_dir)?;
            }
        }
    }

    if let Some(parent) = cache_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    auth.ensure_active()?;
    progress.send(ProgressKind::Cloning, format!("Cloning {display}"));

    let mut builder = RepoBuilder::new();
    builder.bare(true).fetch_options(fetch_options(auth));
    match builder.clone(repo_url.trim(), cache_dir) {
        Ok(repo) => {
            log::info!("Cloned {display} into {}", cache_dir.display());
            Ok(repo)
        }
        Err(err) => {
            let _ = fs::remove_dir_all(cache_dir);
            Err(auth.network_error(err, |message| WorkspaceError::CloneFailed {
                url: display.clone(),
                message,
            }))
        }
    }
}

fn fetch_origin(repo: &Repository, auth: &RemoteAuth, display: &str) -> Result<(), WorkspaceError> {
    let failed = |message: String| WorkspaceError::FetchFailed {
        url: display.to_string(),
        message,
    };
    auth.ensure_active()?;

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| failed(e.message().to_string()))?;
    let mut options = fetch_options(auth);
    options.prune(FetchPrune::On);
    remote
        .fetch(&[] as &[&str], Some(&mut options), None)
        .map_err(|e| auth.network_error(e, failed))?;
    Ok(())
}
