use crate::domains::assistant::{AssistantSupervisor, ProcessInfo, StartRequest};
use crate::domains::git::service::display_remote;
use crate::domains::git::{SetupRequest, WorkspaceProvisioner};
use crate::domains::sessions::entity::{CreateSessionRequest, Session};
use crate::domains::sessions::prompts::{PromptSource, resolve_system_prompt};
use crate::domains::sessions::repository::SessionDbManager;
use crate::errors::BridgeError;
use crate::events::{ProgressKind, ProgressSender};
use crate::infrastructure::database::CredentialType;
use log::{info, warn};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Runs the background half of session creation: repository, prompt, assistant.
pub struct SessionBootstrapper<'a> {
    db_manager: &'a SessionDbManager,
    provisioner: &'a dyn WorkspaceProvisioner,
    supervisor: &'a AssistantSupervisor,
}

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace: PathBuf,
    pub prompt: PromptSource,
    pub process: ProcessInfo,
}

impl<'a> SessionBootstrapper<'a> {
    pub fn new(
        db_manager: &'a SessionDbManager,
        provisioner: &'a dyn WorkspaceProvisioner,
        supervisor: &'a AssistantSupervisor,
    ) -> Self {
        Self {
            db_manager,
            provisioner,
            supervisor,
        }
    }

    /// Leaves no workspace behind when a step after provisioning fails.
    pub async fn bootstrap(
        &self,
        session: &Session,
        request: &CreateSessionRequest,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<BootstrapResult, BridgeError> {
        info!(
            "[session:{}] Bootstrapping '{}' from {}@{}",
            session.session_id,
            session.branch_name,
            display_remote(&session.repo_url),
            session.from_commitish
        );

        let github_token = self
            .db_manager
            .credential(request.user_id, CredentialType::Github)?;

        progress.send(
            ProgressKind::Validating,
            format!("Checking access to {}", display_remote(&session.repo_url)),
        );
        self.provisioner
            .validate_repo_url(&session.repo_url, github_token.clone())
            .await?;

        let workspace = self
            .provisioner
            .setup(
                SetupRequest {
                    repo_url: session.repo_url.clone(),
                    from_commitish: session.from_commitish.clone(),
                    feature_name: session.branch_name.clone(),
                    github_token,
                },
                progress.clone(),
                cancel.clone(),
            )
            .await?;

        match self
            .launch(session, request, progress, &workspace, &cancel)
            .await
        {
            Ok((prompt, process)) => Ok(BootstrapResult {
                workspace,
                prompt,
                process,
            }),
            Err(err) => {
                if let Err(cleanup_err) = self.provisioner.cleanup(&workspace).await {
                    warn!(
                        "[session:{}] Failed to remove workspace after setup error: {cleanup_err}",
                        session.session_id
                    );
                }
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        session: &Session,
        request: &CreateSessionRequest,
        progress: &ProgressSender,
        workspace: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(PromptSource, ProcessInfo), BridgeError> {
        progress.send(ProgressKind::ResolvingPrompt, "Resolving system prompt");
        let prompt = resolve_system_prompt(
            &self.db_manager.db,
            request.user_id,
            request.prompt.as_deref(),
            request.prompt_name.as_deref(),
        )?;

        let credential = self
            .db_manager
            .require_credential(request.user_id, CredentialType::Anthropic)?;

        if cancel.is_cancelled() {
            return Err(BridgeError::unavailable(
                &session.session_id,
                "setup cancelled by shutdown",
            ));
        }
        progress.send(
            ProgressKind::StartingAssistant,
            format!("Starting assistant ({}) with {}", session.model, prompt.describe()),
        );
        let process = self
            .supervisor
            .start(StartRequest {
                session_id: session.session_id.clone(),
                working_dir: workspace.to_path_buf(),
                model: session.model.clone(),
                credential,
                initial_message: Some(prompt.text().to_string()),
                resume_token: None,
            })
            .await?;

        Ok((prompt, process))
    }
}
