use crate::domains::assistant::{AssistantSupervisor, ProcessStatus};
use crate::domains::git::{CommitOutcome, WorkspaceProvisioner};
use crate::domains::sessions::entity::Session;
use log::{info, warn};
use serde::Serialize;

/// What happened during each teardown step. Failures are collected, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub session_id: String,
    pub process_stopped: bool,
    pub assistant_crashed: bool,
    pub commit: Option<CommitOutcome>,
    pub workspace_removed: bool,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn commit_message(session_id: &str, crashed: bool) -> String {
    if crashed {
        format!("Session {session_id} changes (assistant exited unexpectedly)")
    } else {
        format!("Session {session_id} changes")
    }
}

pub struct SessionFinalizer<'a> {
    supervisor: &'a AssistantSupervisor,
    provisioner: &'a dyn WorkspaceProvisioner,
}

impl<'a> SessionFinalizer<'a> {
    pub fn new(
        supervisor: &'a AssistantSupervisor,
        provisioner: &'a dyn WorkspaceProvisioner,
    ) -> Self {
        Self {
            supervisor,
            provisioner,
        }
    }

    /// Stop, commit and push, remove the workspace. Every step runs.
    pub async fn teardown(&self, session: &Session, github_token: Option<String>) -> TeardownReport {
        let session_id = session.session_id.as_str();
        let mut report = TeardownReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };

        report.assistant_crashed =
            self.supervisor.status(session_id).await == Some(ProcessStatus::Error);
        match self.supervisor.stop(session_id).await {
            Ok(stopped) => report.process_stopped = stopped,
            Err(e) => {
                let msg = format!("Stopping assistant failed: {e}");
                warn!("[session:{session_id}] {msg}");
                report.errors.push(msg);
            }
        }

        if session.work_tree_path.exists() {
            let message = commit_message(session_id, report.assistant_crashed);
            match self
                .provisioner
                .commit_and_push(
                    &session.work_tree_path,
                    &session.branch_name,
                    &message,
                    github_token,
                )
                .await
            {
                Ok(outcome) => {
                    if let CommitOutcome::Pushed { commit } = &outcome {
                        info!(
                            "[session:{session_id}] Pushed {commit} to '{}'",
                            session.branch_name
                        );
                    }
                    report.commit = Some(outcome);
                }
                Err(e) => {
                    let msg = format!("Commit and push failed: {e}");
                    warn!("[session:{session_id}] {msg}");
                    report.errors.push(msg);
                }
            }
        } else {
            let msg = format!(
                "Workspace {} is missing; nothing to commit",
                session.work_tree_path.display()
            );
            warn!("[session:{session_id}] {msg}");
            report.errors.push(msg);
        }

        match self.provisioner.cleanup(&session.work_tree_path).await {
            Ok(()) => report.workspace_removed = true,
            Err(e) => {
                let msg = format!("Workspace cleanup failed: {e}");
                warn!("[session:{session_id}] {msg}");
                report.errors.push(msg);
            }
        }

        if report.is_clean() {
            info!("[session:{session_id}] Teardown completed");
        } else {
            warn!(
                "[session:{session_id}] Teardown completed with {} error(s)",
                report.errors.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_is_noted_in_commit_message() {
        assert_eq!(commit_message("abc", false), "Session abc changes");
        assert!(commit_message("abc", true).starts_with("Session abc changes ("));
    }

    #[test]
    fn report_is_clean_without_errors() {
        let mut report = TeardownReport {
            session_id: "abc".into(),
            ..Default::default()
        };
        assert!(report.is_clean());
        report.errors.push("push rejected".into());
        assert!(!report.is_clean());
    }
}
