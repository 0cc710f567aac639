pub mod branches;
pub mod clone;
pub mod operations;
pub mod remote;
pub mod service;
pub mod worktrees;


pub use service::{
    CommitOutcome, GitWorkspaceProvisioner, RepoInfo, SetupRequest, WorkspaceError,
    WorkspaceProvisioner,
};
