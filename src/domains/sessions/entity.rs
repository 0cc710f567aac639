use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domains::assistant::ProcessInfo;
use crate::domains::git::RepoInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Ending,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Ending => "ending",
            SessionStatus::Ended => "ended",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Error)
    }

    /// Statuses that claim the (workspace, channel, thread) scope.
    pub fn occupies_scope(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Active)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Starting, Active) | (Active, Ending) | (Ending, Ended) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn open_statuses() -> [SessionStatus; 3] {
        [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Ending,
        ]
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "active" => Ok(SessionStatus::Active),
            "ending" => Ok(SessionStatus::Ending),
            "ended" => Ok(SessionStatus::Ended),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Owner,
    Collaborator,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Owner => "owner",
            SessionRole::Collaborator => "collaborator",
        }
    }
}

impl FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(SessionRole::Owner),
            "collaborator" => Ok(SessionRole::Collaborator),
            other => Err(format!("unknown session role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    UserToAssistant,
    AssistantToUser,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::UserToAssistant => "user_to_assistant",
            MessageDirection::AssistantToUser => "assistant_to_user",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_to_assistant" => Ok(MessageDirection::UserToAssistant),
            "assistant_to_user" => Ok(MessageDirection::AssistantToUser),
            other => Err(format!("unknown message direction '{other}'")),
        }
    }
}

/// Where in the chat workspace a session is bound. `thread_ts == None` pins it to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatScope {
    pub workspace_id: String,
    pub channel_id: String,
    pub thread_ts: Option<String>,
}

impl ChatScope {
    pub fn new(
        workspace_id: impl Into<String>,
        channel_id: impl Into<String>,
        thread_ts: Option<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            channel_id: channel_id.into(),
            thread_ts: thread_ts.filter(|t| !t.is_empty()),
        }
    }

    pub(crate) fn thread_key(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ChatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_ts {
            Some(thread) => write!(f, "{}/#{} (thread {thread})", self.workspace_id, self.channel_id),
            None => write!(f, "{}/#{}", self.workspace_id, self.channel_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub session_id: String,
    pub workspace_id: String,
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub repo_url: String,
    pub from_commitish: String,
    pub branch_name: String,
    pub work_tree_path: PathBuf,
    pub model: String,
    pub running_cost: f64,
    pub status: SessionStatus,
    pub assistant_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn scope(&self) -> ChatScope {
        ChatScope::new(
            self.workspace_id.clone(),
            self.channel_id.clone(),
            self.thread_ts.clone(),
        )
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMember {
    pub session_row_id: i64,
    pub user_id: i64,
    pub role: SessionRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: i64,
    pub session_row_id: i64,
    pub direction: MessageDirection,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub workspace_id: String,
    pub user_id: i64,
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub repo_url: String,
    pub from_commitish: String,
    pub feature_name: String,
    pub model: String,
    /// Literal system prompt text.
    pub prompt: Option<String>,
    /// Name of a saved prompt owned by the user or shared publicly.
    pub prompt_name: Option<String>,
}

impl CreateSessionRequest {
    pub fn scope(&self) -> ChatScope {
        ChatScope::new(
            self.workspace_id.clone(),
            self.channel_id.clone(),
            self.thread_ts.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueSessionRequest {
    pub feature_name: String,
    pub user_id: i64,
    pub scope: ChatScope,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOutcome {
    pub session: Session,
    pub moved_from: Option<ChatScope>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session: Session,
    pub members: Vec<SessionMember>,
    pub process: Option<ProcessInfo>,
    pub repo: Option<RepoInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_machine() {
        use SessionStatus::*;
        assert!(Starting.can_transition_to(Active));
        assert!(Starting.can_transition_to(Error));
        assert!(Active.can_transition_to(Ending));
        assert!(Ending.can_transition_to(Ended));
        assert!(Ending.can_transition_to(Error));

        assert!(!Starting.can_transition_to(Ended));
        assert!(!Active.can_transition_to(Starting));
        assert!(!Ended.can_transition_to(Error));
        assert!(!Error.can_transition_to(Active));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Ending,
            SessionStatus::Ended,
            SessionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn empty_thread_means_channel_pinned() {
        let scope = ChatScope::new("T1", "C1", Some(String::new()));
        assert_eq!(scope.thread_ts, None);
        assert_eq!(scope.thread_key(), "");
        assert_eq!(scope.to_string(), "T1/#C1");
    }
}
