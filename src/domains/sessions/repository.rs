use crate::{
    domains::sessions::db_sessions::{
        SessionMethods, branch_taken, count_open_sessions_owned_by, insert_member,
        insert_session, is_constraint_violation, open_session_in_scope,
    },
    domains::sessions::entity::{
        ChatScope, CreateSessionRequest, MessageDirection, Session, SessionMember, SessionMessage,
        SessionRole, SessionStatus,
    },
    errors::BridgeError,
    infrastructure::database::{CredentialMethods, CredentialType, Database, User, UserMethods},
};
use chrono::Utc;
use log::{debug, warn};
use std::path::Path;

/// Session persistence with storage failures mapped to bridge error kinds.
#[derive(Clone)]
pub struct SessionDbManager {
    pub db: Database,
}

impl SessionDbManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the `starting` row plus the owner membership, enforcing branch,
    /// scope and quota rules inside one immediate transaction.
    pub fn create_starting_session(
        &self,
        request: &CreateSessionRequest,
        session_id: &str,
        work_tree_path: &Path,
        max_open_per_user: u32,
    ) -> Result<Session, BridgeError> {
        let now = Utc::now();
        let scope = request.scope();
        let mut session = Session {
            id: 0,
            session_id: session_id.to_string(),
            workspace_id: scope.workspace_id.clone(),
            channel_id: scope.channel_id.clone(),
            thread_ts: scope.thread_ts.clone(),
            repo_url: request.repo_url.trim().to_string(),
            from_commitish: request.from_commitish.trim().to_string(),
            branch_name: request.feature_name.clone(),
            work_tree_path: work_tree_path.to_path_buf(),
            model: request.model.clone(),
            running_cost: 0.0,
            status: SessionStatus::Starting,
            assistant_session_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        let row_id = self
            .db
            .with_transaction(|tx| {
                if branch_taken(tx, &session.branch_name)? {
                    return Err(BridgeError::session_exists(format!(
                        "branch '{}' is already used by another session",
                        session.branch_name
                    ))
                    .into());
                }
                if let Some(existing) = open_session_in_scope(tx, &scope)? {
                    return Err(BridgeError::session_exists(format!(
                        "session {} is already running in {scope}",
                        existing.session_id
                    ))
                    .into());
                }
                let open = count_open_sessions_owned_by(tx, request.user_id)?;
                if open >= i64::from(max_open_per_user) {
                    return Err(BridgeError::session_exists(format!(
                        "you already have {open} open sessions (limit {max_open_per_user})"
                    ))
                    .into());
                }

                let row_id = insert_session(tx, &session)?;
                insert_member(tx, row_id, request.user_id, SessionRole::Owner)?;
                Ok(row_id)
            })
            .map_err(|err| match err.downcast::<BridgeError>() {
                Ok(bridge) => bridge,
                Err(err) if is_constraint_violation(&err) => {
                    debug!("Create raced with another session: {err}");
                    BridgeError::session_exists(format!(
                        "branch '{}' or this channel is already taken",
                        session.branch_name
                    ))
                }
                Err(err) => BridgeError::database(err),
            })?;

        session.id = row_id;
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, BridgeError> {
        self.db
            .get_session(session_id)
            .map_err(|e| BridgeError::from_session_lookup(session_id, e))
    }

    pub fn get_session_by_branch(&self, branch_name: &str) -> Result<Session, BridgeError> {
        self.db
            .get_session_by_branch(branch_name)
            .map_err(|e| BridgeError::from_session_lookup(branch_name, e))
    }

    pub fn get_active_session_for_scope(
        &self,
        scope: &ChatScope,
    ) -> Result<Option<Session>, BridgeError> {
        self.db
            .get_active_session_for_scope(scope)
            .map_err(BridgeError::database)
    }

    pub fn list_open_sessions(&self) -> Result<Vec<Session>, BridgeError> {
        self.db.list_open_sessions().map_err(BridgeError::database)
    }

    pub fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>, BridgeError> {
        self.db
            .list_sessions_for_user(user_id)
            .map_err(BridgeError::database)
    }

    /// Conditional status change; `false` when the row was not in any `from` status.
    pub fn transition(
        &self,
        session_id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<bool, BridgeError> {
        self.db
            .transition_session_status(session_id, from, to)
            .map_err(BridgeError::database)
    }

    /// Moves any non-terminal session to `error`.
    pub fn mark_error(&self, session_id: &str) -> Result<bool, BridgeError> {
        self.transition(session_id, &SessionStatus::open_statuses(), SessionStatus::Error)
    }

    pub fn add_cost(&self, session_id: &str, delta: f64) -> Result<f64, BridgeError> {
        self.db
            .add_session_cost(session_id, delta)
            .map_err(|e| BridgeError::from_session_lookup(session_id, e))
    }

    pub fn touch(&self, session_id: &str) {
        if let Err(err) = self.db.touch_session(session_id) {
            warn!("Failed to record activity for session {session_id}: {err}");
        }
    }

    pub fn set_continuation_token(&self, session_id: &str, token: &str) -> Result<(), BridgeError> {
        self.db
            .set_assistant_session_id(session_id, token)
            .map_err(BridgeError::database)
    }

    pub fn update_scope(&self, session_id: &str, scope: &ChatScope) -> Result<(), BridgeError> {
        self.db
            .update_session_scope(session_id, scope)
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    BridgeError::session_exists(format!("another session is already running in {scope}"))
                } else {
                    BridgeError::from_session_lookup(session_id, err)
                }
            })
    }

    pub fn member_role(
        &self,
        session: &Session,
        user_id: i64,
    ) -> Result<Option<SessionRole>, BridgeError> {
        self.db
            .get_member_role(session.id, user_id)
            .map_err(BridgeError::database)
    }

    pub fn owner_id(&self, session: &Session) -> Result<i64, BridgeError> {
        self.db
            .get_session_owner(session.id)
            .map_err(BridgeError::database)
    }

    pub fn add_member(
        &self,
        session: &Session,
        user_id: i64,
        role: SessionRole,
    ) -> Result<(), BridgeError> {
        self.db
            .add_session_member(session.id, user_id, role)
            .map_err(BridgeError::database)
    }

    pub fn remove_member(&self, session: &Session, user_id: i64) -> Result<bool, BridgeError> {
        self.db
            .remove_session_member(session.id, user_id)
            .map_err(BridgeError::database)
    }

    pub fn list_members(&self, session: &Session) -> Result<Vec<SessionMember>, BridgeError> {
        self.db
            .list_session_members(session.id)
            .map_err(BridgeError::database)
    }

    /// Audit trail; failures are logged and never block the conversation.
    pub fn record_message(&self, session: &Session, direction: MessageDirection, content: &str) {
        if let Err(err) = self.db.record_session_message(session.id, direction, content) {
            warn!(
                "Failed to record {} message for session {}: {err}",
                direction.as_str(),
                session.session_id
            );
        }
    }

    pub fn list_messages(
        &self,
        session: &Session,
        limit: usize,
    ) -> Result<Vec<SessionMessage>, BridgeError> {
        self.db
            .list_session_messages(session.id, limit)
            .map_err(BridgeError::database)
    }

    pub fn get_user(&self, user_id: i64) -> Result<User, BridgeError> {
        self.db.get_user(user_id).map_err(|e| {
            let message = e.to_string();
            if message.to_lowercase().contains("no rows") {
                BridgeError::invalid_command(format!("unknown user {user_id}"))
            } else {
                BridgeError::database(message)
            }
        })
    }

    pub fn create_or_update_user(
        &self,
        workspace_id: &str,
        external_user_id: &str,
        display_name: &str,
    ) -> Result<User, BridgeError> {
        self.db
            .create_or_update_user(workspace_id, external_user_id, display_name)
            .map_err(BridgeError::database)
    }

    pub fn store_credential(
        &self,
        user_id: i64,
        kind: CredentialType,
        value: &str,
    ) -> Result<(), BridgeError> {
        if value.trim().is_empty() {
            return Err(BridgeError::invalid_command("credential value is empty"));
        }
        self.db
            .store_credential(user_id, kind, value.trim())
            .map_err(BridgeError::database)
    }

    pub fn credential(
        &self,
        user_id: i64,
        kind: CredentialType,
    ) -> Result<Option<String>, BridgeError> {
        self.db
            .get_credential(user_id, kind)
            .map_err(BridgeError::database)
    }

    pub fn require_credential(
        &self,
        user_id: i64,
        kind: CredentialType,
    ) -> Result<String, BridgeError> {
        self.credential(user_id, kind)?
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| BridgeError::NoCredentials {
                credential_type: kind.to_string(),
            })
    }

    pub fn has_required_credentials(&self, user_id: i64) -> Result<bool, BridgeError> {
        self.db
            .has_required_credentials(user_id)
            .map_err(BridgeError::database)
    }
}
