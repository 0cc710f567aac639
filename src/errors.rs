use serde::Serialize;
use std::fmt;

use crate::domains::git::WorkspaceError;

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum BridgeError {
    InvalidCommand {
        message: String,
    },
    SessionExists {
        message: String,
    },
    SessionNotFound {
        session_id: String,
    },
    NoCredentials {
        credential_type: String,
    },
    ClaudeUnavailable {
        session_id: String,
        message: String,
    },
    RepoAccess {
        message: String,
    },
    Unauthorized {
        message: String,
    },
    InvalidChannel {
        channel_id: String,
    },
    AssistantTimeout {
        session_id: String,
        waited_secs: u64,
    },
    DatabaseError {
        message: String,
    },
    Internal {
        message: String,
    },
}

impl BridgeError {
    /// Stable machine-readable code shown next to the message in chat.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCommand { .. } => "INVALID_COMMAND",
            Self::SessionExists { .. } => "SESSION_EXISTS",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::NoCredentials { .. } => "NO_CREDENTIALS",
            Self::ClaudeUnavailable { .. } => "CLAUDE_UNAVAILABLE",
            Self::RepoAccess { .. } => "REPO_ACCESS",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::InvalidChannel { .. } => "INVALID_CHANNEL",
            Self::AssistantTimeout { .. } => "ASSISTANT_TIMEOUT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn invalid_command(message: impl ToString) -> Self {
        BridgeError::InvalidCommand {
            message: message.to_string(),
        }
    }

    pub fn session_exists(message: impl ToString) -> Self {
        BridgeError::SessionExists {
            message: message.to_string(),
        }
    }

    pub fn not_found(session_id: &str) -> Self {
        BridgeError::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn unavailable(session_id: &str, message: impl ToString) -> Self {
        BridgeError::ClaudeUnavailable {
            session_id: session_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn unauthorized(message: impl ToString) -> Self {
        BridgeError::Unauthorized {
            message: message.to_string(),
        }
    }

    pub fn database(error: impl ToString) -> Self {
        BridgeError::DatabaseError {
            message: error.to_string(),
        }
    }

    pub fn internal(error: impl ToString) -> Self {
        BridgeError::Internal {
            message: error.to_string(),
        }
    }

    /// Maps a persistence failure for a session lookup, keeping "no rows" distinct.
    pub fn from_session_lookup(session_id: &str, error: impl ToString) -> Self {
        let message = error.to_string();
        let normalized = message.to_lowercase();
        if normalized.contains("query returned no rows") || normalized.contains("session not found")
        {
            BridgeError::not_found(session_id)
        } else {
            BridgeError::DatabaseError { message }
        }
    }

    /// Whether a chat user can fix this by changing the command.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::InvalidCommand { .. }
                | Self::SessionExists { .. }
                | Self::NoCredentials { .. }
                | Self::InvalidChannel { .. }
                | Self::Unauthorized { .. }
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidCommand { message } => write!(f, "Invalid command: {message}"),
            Self::SessionExists { message } => write!(f, "Session already exists: {message}"),
            Self::SessionNotFound { session_id } => {
                write!(f, "Session '{session_id}' not found")
            }
            Self::NoCredentials { credential_type } => {
                write!(
                    f,
                    "No '{credential_type}' credential stored; add one before starting a session"
                )
            }
            Self::ClaudeUnavailable {
                session_id,
                message,
            } => {
                write!(f, "Assistant for session '{session_id}' is unavailable: {message}")
            }
            Self::RepoAccess { message } => write!(f, "Repository access failed: {message}"),
            Self::Unauthorized { message } => write!(f, "Not authorized: {message}"),
            Self::InvalidChannel { channel_id } => {
                write!(f, "Sessions cannot be started in #{channel_id}")
            }
            Self::AssistantTimeout {
                session_id,
                waited_secs,
            } => {
                write!(
                    f,
                    "Assistant for session '{session_id}' produced no output within {waited_secs}s"
                )
            }
            Self::DatabaseError { message } => write!(f, "Database error: {message}"),
            Self::Internal { message } => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<BridgeError> for String {
    fn from(error: BridgeError) -> Self {
        error.to_string()
    }
}

impl From<WorkspaceError> for BridgeError {
    fn from(error: WorkspaceError) -> Self {
        match error {
            WorkspaceError::WorkspaceExists(_) | WorkspaceError::BranchExists(_) => {
                BridgeError::session_exists(error)
            }
            WorkspaceError::InvalidRepoUrl { .. } => BridgeError::invalid_command(error),
            WorkspaceError::CommitResolution { .. } => BridgeError::invalid_command(error),
            WorkspaceError::Io(_) | WorkspaceError::Cleanup { .. } => BridgeError::internal(error),
            other => BridgeError::RepoAccess {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BridgeError::invalid_command("x").code(), "INVALID_COMMAND");
        assert_eq!(BridgeError::not_found("s").code(), "SESSION_NOT_FOUND");
        assert_eq!(
            BridgeError::InvalidChannel {
                channel_id: "general".into()
            }
            .code(),
            "INVALID_CHANNEL"
        );
    }

    #[test]
    fn session_lookup_distinguishes_missing_rows() {
        let missing = BridgeError::from_session_lookup("abc", "Query returned no rows");
        assert_eq!(missing, BridgeError::not_found("abc"));

        let broken = BridgeError::from_session_lookup("abc", "disk I/O error");
        assert_eq!(broken.code(), "DATABASE_ERROR");
    }

    #[test]
    fn workspace_errors_map_to_kinds() {
        let exists: BridgeError = WorkspaceError::BranchExists("feat".into()).into();
        assert_eq!(exists.code(), "SESSION_EXISTS");

        let collision: BridgeError =
            WorkspaceError::WorkspaceExists(PathBuf::from("/tmp/feat")).into();
        assert_eq!(collision.code(), "SESSION_EXISTS");

        let clone: BridgeError = WorkspaceError::CloneFailed {
            url: "https://github.com/a/b".into(),
            message: "timeout".into(),
        }
        .into();
        assert_eq!(clone.code(), "REPO_ACCESS");
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(BridgeError::unauthorized("only the owner")).unwrap();
        assert_eq!(json["type"], "Unauthorized");
        assert_eq!(json["data"]["message"], "only the owner");
    }
}
