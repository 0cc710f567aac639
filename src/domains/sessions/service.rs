use crate::config::{AssistantConfig, SessionConfig};
use crate::domains::assistant::{
    AssistantEvent, AssistantEvents, AssistantSupervisor, ProcessStatus, StartRequest,
    StopAllReport, TurnReply,
};
use crate::domains::git::{GitWorkspaceProvisioner, WorkspaceProvisioner};
use crate::domains::sessions::entity::{
    ChatScope, ContinueOutcome, ContinueSessionRequest, CreateSessionRequest, MessageDirection,
    Session, SessionInfo, SessionMessage, SessionRole, SessionStatus,
};
use crate::domains::sessions::lifecycle::{
    BootstrapResult, SessionBootstrapper, SessionFinalizer, TeardownReport,
};
use crate::domains::sessions::prompts::resolve_system_prompt;
use crate::domains::sessions::repository::SessionDbManager;
use crate::domains::sessions::validation::validate_create_request;
use crate::errors::BridgeError;
use crate::events::{ProgressKind, ProgressSender, ProgressStream, SessionEvent};
use crate::infrastructure::database::{CredentialType, Database, User};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

const SESSION_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub ended: Vec<TeardownReport>,
    pub failures: Vec<(String, String)>,
    pub stop_all: StopAllReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub failed_setups: Vec<String>,
    pub finished_teardowns: Vec<String>,
    pub resumable: Vec<String>,
}

/// Orchestrates persistence, workspaces and assistant processes for chat sessions.
#[derive(Clone)]
pub struct SessionManager {
    db_manager: SessionDbManager,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    supervisor: Arc<AssistantSupervisor>,
    config: Arc<SessionConfig>,
    events: broadcast::Sender<SessionEvent>,
    setup_cancel: CancellationToken,
    setup_tasks: TaskTracker,
}

impl SessionManager {
    pub fn new(db: Database, session: SessionConfig, assistant: AssistantConfig) -> Self {
        let provisioner = Arc::new(GitWorkspaceProvisioner::new(
            session.repos_dir(),
            session.worktrees_dir(),
        ));
        Self::with_provisioner(db, session, assistant, provisioner)
    }

    /// Must run inside a tokio runtime: spawns the assistant event forwarder.
    pub fn with_provisioner(
        db: Database,
        session: SessionConfig,
        assistant: AssistantConfig,
        provisioner: Arc<dyn WorkspaceProvisioner>,
    ) -> Self {
        let (supervisor, assistant_events) = AssistantSupervisor::new(assistant);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let db_manager = SessionDbManager::new(db);

        tokio::spawn(forward_assistant_events(
            db_manager.clone(),
            events.clone(),
            assistant_events,
        ));

        Self {
            db_manager,
            provisioner,
            supervisor,
            config: Arc::new(session),
            events,
            setup_cancel: CancellationToken::new(),
            setup_tasks: TaskTracker::new(),
        }
    }

    pub fn db_manager(&self) -> &SessionDbManager {
        &self.db_manager
    }

    pub fn supervisor(&self) -> &Arc<AssistantSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Validates and persists a `starting` session. Nothing is provisioned yet.
    pub fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, BridgeError> {
        validate_create_request(request, &self.config, self.supervisor.config())?;
        self.db_manager.get_user(request.user_id)?;
        self.db_manager
            .require_credential(request.user_id, CredentialType::Anthropic)?;
        resolve_system_prompt(
            &self.db_manager.db,
            request.user_id,
            request.prompt.as_deref(),
            request.prompt_name.as_deref(),
        )?;

        let session_id = Uuid::new_v4().simple().to_string();
        let work_tree_path = self.provisioner.workspace_path(&request.feature_name);
        let session = self.db_manager.create_starting_session(
            request,
            &session_id,
            &work_tree_path,
            self.config.max_sessions_per_user,
        )?;

        info!(
            "[sessions] Created session {session_id} for '{}' in {}",
            session.branch_name,
            session.scope()
        );
        self.publish_status(&session.session_id, SessionStatus::Starting);
        Ok(session)
    }

    /// Provisions the workspace and starts the assistant on a background task.
    /// The returned handle completes after the session is `active` or `error`.
    pub fn setup_session_async(
        &self,
        session: Session,
        request: CreateSessionRequest,
        progress: ProgressSender,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        self.setup_tasks.spawn(async move {
            let session_id = session.session_id.clone();
            let work_tree_path = session.work_tree_path.clone();
            let cancel = manager.setup_cancel.child_token();

            let inner = {
                let manager = manager.clone();
                let progress = progress.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    SessionBootstrapper::new(
                        &manager.db_manager,
                        manager.provisioner.as_ref(),
                        &manager.supervisor,
                    )
                    .bootstrap(&session, &request, &progress, cancel)
                    .await
                })
            };

            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!("[session:{session_id}] Setup task aborted: {join_error}");
                    manager.discard_setup(&session_id, &work_tree_path).await;
                    Err(BridgeError::internal(format!(
                        "session setup aborted: {join_error}"
                    )))
                }
            };

            match outcome {
                Ok(result) if cancel.is_cancelled() => {
                    warn!("[session:{session_id}] Setup finished after shutdown began");
                    manager.discard_setup(&session_id, &result.workspace).await;
                    manager.fail_setup(
                        &session_id,
                        &BridgeError::unavailable(&session_id, "the bridge is shutting down"),
                        &progress,
                    );
                }
                Ok(result) => manager.complete_setup(&session_id, result, &progress).await,
                Err(err) => manager.fail_setup(&session_id, &err, &progress),
            }
        })
    }

    /// `create_session` followed by background setup.
    pub fn start_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<(Session, ProgressStream), BridgeError> {
        let session = self.create_session(&request)?;
        let (progress, stream) = ProgressSender::channel(&session.session_id);
        self.setup_session_async(session.clone(), request, progress);
        Ok((session, stream))
    }

    async fn complete_setup(
        &self,
        session_id: &str,
        result: BootstrapResult,
        progress: &ProgressSender,
    ) {
        match self
            .db_manager
            .transition(session_id, &[SessionStatus::Starting], SessionStatus::Active)
        {
            Ok(true) => {
                self.publish_status(session_id, SessionStatus::Active);
                progress.send(
                    ProgressKind::Ready,
                    format!(
                        "Session ready in {} (assistant pid {})",
                        result.workspace.display(),
                        result
                            .process
                            .pid
                            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
                    ),
                );
            }
            outcome => {
                if let Err(e) = &outcome {
                    error!("[session:{session_id}] Failed to activate session: {e}");
                    if let Ok(true) = self.db_manager.mark_error(session_id) {
                        self.publish_status(session_id, SessionStatus::Error);
                    }
                } else {
                    warn!("[session:{session_id}] Session closed while setup was running");
                }
                self.discard_setup(session_id, &result.workspace).await;
                progress.send(
                    ProgressKind::Failed,
                    "Session was closed before setup finished",
                );
            }
        }
    }

    async fn discard_setup(&self, session_id: &str, workspace: &Path) {
        if let Err(e) = self.supervisor.stop(session_id).await {
            warn!("[session:{session_id}] Failed to stop assistant: {e}");
        }
        if let Err(e) = self.provisioner.cleanup(workspace).await {
            warn!("[session:{session_id}] Failed to remove workspace: {e}");
        }
    }

    fn fail_setup(&self, session_id: &str, err: &BridgeError, progress: &ProgressSender) {
        match self.db_manager.mark_error(session_id) {
            Ok(true) => self.publish_status(session_id, SessionStatus::Error),
            Ok(false) => debug!("[session:{session_id}] Already terminal after setup failure"),
            Err(e) => error!("[session:{session_id}] Failed to record setup failure: {e}"),
        }
        progress.send(ProgressKind::Failed, err.to_string());
    }

    /// Delivers one chat message and returns the assistant's reply.
    pub async fn send_to_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<TurnReply, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(BridgeError::unavailable(
                session_id,
                format!("session is {}", session.status),
            ));
        }
        self.ensure_attached(&session).await?;

        self.db_manager
            .record_message(&session, MessageDirection::UserToAssistant, message);
        self.db_manager.touch(session_id);

        let reply = self.supervisor.send(session_id, message).await?;

        self.db_manager
            .record_message(&session, MessageDirection::AssistantToUser, &reply.text);
        if reply.cost_usd > 0.0 {
            let total = self.db_manager.add_cost(session_id, reply.cost_usd)?;
            self.publish(SessionEvent::CostUpdated {
                session_id: session_id.to_string(),
                delta_usd: reply.cost_usd,
                total_usd: total,
            });
        } else {
            self.db_manager.touch(session_id);
        }
        Ok(reply)
    }

    /// Restarts the assistant with its continuation token when no process is
    /// tracked for an `active` session, which happens after a service restart.
    async fn ensure_attached(&self, session: &Session) -> Result<(), BridgeError> {
        let session_id = session.session_id.as_str();
        if self.supervisor.is_tracked(session_id).await {
            return Ok(());
        }
        let Some(token) = session.assistant_session_id.clone() else {
            return Err(BridgeError::unavailable(
                session_id,
                "assistant is not running and the conversation cannot be resumed",
            ));
        };

        let owner = self.db_manager.owner_id(session)?;
        let credential = self
            .db_manager
            .require_credential(owner, CredentialType::Anthropic)?;
        info!("[session:{session_id}] Reattaching assistant with continuation token");

        match self
            .supervisor
            .start(StartRequest {
                session_id: session_id.to_string(),
                working_dir: session.work_tree_path.clone(),
                model: session.model.clone(),
                credential,
                initial_message: None,
                resume_token: Some(token),
            })
            .await
        {
            Ok(_) | Err(BridgeError::SessionExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stops the assistant, publishes the work and removes the workspace.
    /// Only one concurrent caller wins the `active → ending` transition.
    pub async fn end_session(&self, session_id: &str) -> Result<TeardownReport, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        if !self.db_manager.transition(
            session_id,
            &[SessionStatus::Active],
            SessionStatus::Ending,
        )? {
            let status = self
                .db_manager
                .get_session(session_id)
                .map_or(session.status, |current| current.status);
            return Err(BridgeError::unavailable(
                session_id,
                format!("session is {status}"),
            ));
        }
        info!("[session:{session_id}] Ending session '{}'", session.branch_name);
        self.publish_status(session_id, SessionStatus::Ending);

        Ok(self.finish_teardown(&session).await)
    }

    async fn finish_teardown(&self, session: &Session) -> TeardownReport {
        let session_id = session.session_id.as_str();
        let github_token = self.owner_github_token(session);
        let report = SessionFinalizer::new(&self.supervisor, self.provisioner.as_ref())
            .teardown(session, github_token)
            .await;

        match self
            .db_manager
            .transition(session_id, &[SessionStatus::Ending], SessionStatus::Ended)
        {
            Ok(true) => {
                info!("[session:{session_id}] Session ended");
                self.publish_status(session_id, SessionStatus::Ended);
            }
            Ok(false) => warn!("[session:{session_id}] Session left 'ending' during teardown"),
            Err(e) => error!("[session:{session_id}] Failed to mark session ended: {e}"),
        }
        report
    }

    fn owner_github_token(&self, session: &Session) -> Option<String> {
        let token = self
            .db_manager
            .owner_id(session)
            .and_then(|owner| self.db_manager.credential(owner, CredentialType::Github));
        match token {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    "[session:{}] GitHub credential lookup failed: {e}",
                    session.session_id
                );
                None
            }
        }
    }

    /// Owner-only variant of `end_session`.
    pub async fn stop_session(
        &self,
        session_id: &str,
        requester: i64,
    ) -> Result<TeardownReport, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        self.require_owner(&session, requester, "stop")?;
        self.end_session(session_id).await
    }

    pub fn add_collaborator(
        &self,
        session_id: &str,
        requester: i64,
        user_id: i64,
    ) -> Result<(), BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        self.require_owner(&session, requester, "add collaborators to")?;
        self.db_manager.get_user(user_id)?;
        if self.db_manager.member_role(&session, user_id)?.is_some() {
            return Ok(());
        }
        self.db_manager
            .add_member(&session, user_id, SessionRole::Collaborator)?;
        info!("[session:{session_id}] User {user_id} added as collaborator");
        Ok(())
    }

    /// `Ok(false)` when the user was not a collaborator. Owners cannot be removed.
    pub fn remove_collaborator(
        &self,
        session_id: &str,
        requester: i64,
        user_id: i64,
    ) -> Result<bool, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        self.require_owner(&session, requester, "remove collaborators from")?;
        self.db_manager.remove_member(&session, user_id)
    }

    fn require_owner(
        &self,
        session: &Session,
        requester: i64,
        action: &str,
    ) -> Result<(), BridgeError> {
        if self.db_manager.owner_id(session)? != requester {
            return Err(BridgeError::unauthorized(format!(
                "only the owner can {action} session '{}'",
                session.branch_name
            )));
        }
        Ok(())
    }

    /// Rebinds an active session to the caller's channel or thread.
    pub fn continue_session(
        &self,
        request: &ContinueSessionRequest,
    ) -> Result<ContinueOutcome, BridgeError> {
        let session = self.db_manager.get_session_by_branch(&request.feature_name)?;
        if self
            .db_manager
            .member_role(&session, request.user_id)?
            .is_none()
        {
            return Err(BridgeError::unauthorized(format!(
                "you are not a member of session '{}'",
                request.feature_name
            )));
        }
        if session.status != SessionStatus::Active {
            return Err(BridgeError::unavailable(
                &session.session_id,
                format!("session is {}", session.status),
            ));
        }

        let from = session.scope();
        if from == request.scope {
            return Ok(ContinueOutcome {
                session,
                moved_from: None,
            });
        }
        if let Some(occupant) = self
            .db_manager
            .get_active_session_for_scope(&request.scope)?
        {
            return Err(BridgeError::session_exists(format!(
                "session '{}' is already running in {}",
                occupant.branch_name, request.scope
            )));
        }

        self.db_manager
            .update_scope(&session.session_id, &request.scope)?;
        let moved = self.db_manager.get_session(&session.session_id)?;
        info!(
            "[session:{}] Moved from {from} to {}",
            moved.session_id, request.scope
        );
        self.publish(SessionEvent::Moved {
            session_id: moved.session_id.clone(),
            from: from.clone(),
            to: request.scope.clone(),
        });
        Ok(ContinueOutcome {
            session: moved,
            moved_from: Some(from),
        })
    }

    /// Shutdown path: cancels pending setups and waits for them to settle,
    /// ends active sessions, then stops whatever processes remain.
    pub async fn end_all_active_sessions(&self) -> ShutdownReport {
        self.setup_cancel.cancel();
        self.setup_tasks.close();
        let mut report = ShutdownReport::default();

        let pending = self.setup_tasks.len();
        if pending > 0 {
            info!("[sessions] Waiting for {pending} session setup(s) to settle");
        }
        let window = self.supervisor.config().shutdown_timeout();
        if tokio::time::timeout(window, self.setup_tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "[sessions] {} setup(s) still running after {}s",
                self.setup_tasks.len(),
                window.as_secs()
            );
        }

        let sessions = match self.db_manager.list_open_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("[sessions] Failed to list open sessions for shutdown: {e}");
                report.failures.push(("*".to_string(), e.to_string()));
                Vec::new()
            }
        };

        let active: Vec<&Session> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect();
        info!("[sessions] Ending {} active session(s)", active.len());

        let results = join_all(active.iter().map(|session| async move {
            (
                session.session_id.clone(),
                self.end_session(&session.session_id).await,
            )
        }))
        .await;
        for (session_id, result) in results {
            match result {
                Ok(teardown) => report.ended.push(teardown),
                Err(e) => {
                    warn!("[session:{session_id}] Failed to end during shutdown: {e}");
                    report.failures.push((session_id, e.to_string()));
                }
            }
        }

        report.stop_all = self.supervisor.stop_all().await;
        report
    }

    /// Settles rows left behind by a previous run: unfinished setups become
    /// `error`, interrupted teardowns are completed, active sessions resume lazily.
    pub async fn recover_after_restart(&self) -> Result<RecoveryReport, BridgeError> {
        let mut report = RecoveryReport::default();
        for session in self.db_manager.list_open_sessions()? {
            let session_id = session.session_id.clone();
            match session.status {
                SessionStatus::Starting => {
                    if self.db_manager.mark_error(&session_id)? {
                        self.publish_status(&session_id, SessionStatus::Error);
                    }
                    if let Err(e) = self.provisioner.cleanup(&session.work_tree_path).await {
                        warn!("[session:{session_id}] Failed to remove partial workspace: {e}");
                    }
                    report.failed_setups.push(session_id);
                }
                SessionStatus::Ending => {
                    self.finish_teardown(&session).await;
                    report.finished_teardowns.push(session_id);
                }
                SessionStatus::Active => report.resumable.push(session_id),
                SessionStatus::Ended | SessionStatus::Error => {}
            }
        }

        info!(
            "[sessions] Recovery: {} failed setup(s), {} teardown(s) finished, {} resumable",
            report.failed_setups.len(),
            report.finished_teardowns.len(),
            report.resumable.len()
        );
        Ok(report)
    }

    pub async fn get_session_info(&self, session_id: &str) -> Result<SessionInfo, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        let members = self.db_manager.list_members(&session)?;
        let process = self.supervisor.info(session_id).await;
        let repo = if session.work_tree_path.exists() {
            match self.provisioner.repo_info(&session.work_tree_path).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("[session:{session_id}] Repository info unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        Ok(SessionInfo {
            session,
            members,
            process,
            repo,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, BridgeError> {
        self.db_manager.get_session(session_id)
    }

    pub fn get_active_session_for_scope(
        &self,
        scope: &ChatScope,
    ) -> Result<Option<Session>, BridgeError> {
        self.db_manager.get_active_session_for_scope(scope)
    }

    pub fn list_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, BridgeError> {
        self.db_manager.list_sessions_for_user(user_id)
    }

    pub fn list_open_sessions(&self) -> Result<Vec<Session>, BridgeError> {
        self.db_manager.list_open_sessions()
    }

    pub fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<SessionMessage>, BridgeError> {
        let session = self.db_manager.get_session(session_id)?;
        self.db_manager.list_messages(&session, limit)
    }

    pub fn create_or_update_user(
        &self,
        workspace_id: &str,
        external_user_id: &str,
        display_name: &str,
    ) -> Result<User, BridgeError> {
        self.db_manager
            .create_or_update_user(workspace_id, external_user_id, display_name)
    }

    pub fn store_credential(
        &self,
        user_id: i64,
        kind: CredentialType,
        value: &str,
    ) -> Result<(), BridgeError> {
        self.db_manager.get_user(user_id)?;
        self.db_manager.store_credential(user_id, kind, value)
    }

    pub fn has_required_credentials(&self, user_id: i64) -> Result<bool, BridgeError> {
        self.db_manager.has_required_credentials(user_id)
    }

    pub(crate) fn publish_status(&self, session_id: &str, status: SessionStatus) {
        self.publish(SessionEvent::StatusChanged {
            session_id: session_id.to_string(),
            status,
        });
    }

    fn publish(&self, event: SessionEvent) {
        debug!("[sessions] {} for {}", event.as_str(), event.session_id());
        // No subscribers is normal when nothing is listening.
        let _ = self.events.send(event);
    }
}

/// Applies assistant notifications to the store and rebroadcasts them.
/// Ends once the supervisor and all of its processes are gone.
async fn forward_assistant_events(
    db_manager: SessionDbManager,
    events: broadcast::Sender<SessionEvent>,
    mut assistant_events: AssistantEvents,
) {
    while let Some(event) = assistant_events.recv().await {
        match event {
            AssistantEvent::Initialized {
                session_id,
                continuation_token,
            } => {
                debug!("[session:{session_id}] Continuation token {continuation_token}");
                if let Err(e) = db_manager.set_continuation_token(&session_id, &continuation_token)
                {
                    warn!("[session:{session_id}] Failed to persist continuation token: {e}");
                }
            }
            AssistantEvent::Output { session_id, text } => {
                let _ = events.send(SessionEvent::Output { session_id, text });
            }
            AssistantEvent::Cost {
                session_id,
                cost_usd,
            } => match db_manager.add_cost(&session_id, cost_usd) {
                Ok(total) => {
                    let _ = events.send(SessionEvent::CostUpdated {
                        session_id,
                        delta_usd: cost_usd,
                        total_usd: total,
                    });
                }
                Err(e) => warn!("[session:{session_id}] Failed to record cost {cost_usd}: {e}"),
            },
            AssistantEvent::Exited {
                session_id,
                status,
                exit,
            } => {
                if status == ProcessStatus::Error {
                    warn!(
                        "[session:{session_id}] Assistant crashed (code {:?}); the session stays open until ended",
                        exit.code
                    );
                } else {
                    debug!("[session:{session_id}] Assistant exited ({status})");
                }
            }
        }
    }
    debug!("[sessions] Assistant event stream closed");
}
