use crate::domains::sessions::entity::{
    ChatScope, MessageDirection, Session, SessionMember, SessionMessage, SessionRole,
    SessionStatus,
};
use crate::infrastructure::database::Database;
use crate::infrastructure::database::timestamps::{from_epoch_lossy, from_epoch_lossy_opt};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::PathBuf;

const SESSION_COLUMNS: &str = "id, session_id, workspace_id, channel_id, thread_ts, repo_url,
    from_commitish, branch_name, work_tree_path, model, running_cost, status,
    assistant_session_id, created_at, updated_at, ended_at";

pub trait SessionMethods {
    fn get_session(&self, session_id: &str) -> Result<Session>;
    fn get_session_by_branch(&self, branch_name: &str) -> Result<Session>;
    /// `Ok(None)` when nothing occupies the scope.
    fn get_active_session_for_scope(&self, scope: &ChatScope) -> Result<Option<Session>>;
    fn list_open_sessions(&self) -> Result<Vec<Session>>;
    fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>>;
    /// Conditional update; returns false when the session was not in one of `from`.
    fn transition_session_status(
        &self,
        session_id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<bool>;
    fn add_session_cost(&self, session_id: &str, delta: f64) -> Result<f64>;
    fn touch_session(&self, session_id: &str) -> Result<()>;
    fn set_assistant_session_id(&self, session_id: &str, token: &str) -> Result<()>;
    fn update_session_scope(&self, session_id: &str, scope: &ChatScope) -> Result<()>;
    fn add_session_member(&self, session_row_id: i64, user_id: i64, role: SessionRole)
    -> Result<()>;
    fn remove_session_member(&self, session_row_id: i64, user_id: i64) -> Result<bool>;
    fn get_session_owner(&self, session_row_id: i64) -> Result<i64>;
    fn get_member_role(&self, session_row_id: i64, user_id: i64) -> Result<Option<SessionRole>>;
    fn list_session_members(&self, session_row_id: i64) -> Result<Vec<SessionMember>>;
    fn record_session_message(
        &self,
        session_row_id: i64,
        direction: MessageDirection,
        content: &str,
    ) -> Result<()>;
    fn list_session_messages(&self, session_row_id: i64, limit: usize)
    -> Result<Vec<SessionMessage>>;
}

impl SessionMethods for Database {
    fn get_session(&self, session_id: &str) -> Result<Session> {
        let conn = self.get_conn()?;
        let session = conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            params![session_id],
            row_to_session,
        )?;
        Ok(session)
    }

    fn get_session_by_branch(&self, branch_name: &str) -> Result<Session> {
        let conn = self.get_conn()?;
        let session = conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE branch_name = ?1"),
            params![branch_name],
            row_to_session,
        )?;
        Ok(session)
    }

    fn get_active_session_for_scope(&self, scope: &ChatScope) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        open_session_in_scope(&conn, scope)
    }

    fn list_open_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE status IN ({})
             ORDER BY updated_at ASC",
            status_list(&SessionStatus::open_statuses())
        ))?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.session_id, s.workspace_id, s.channel_id, s.thread_ts, s.repo_url,
                    s.from_commitish, s.branch_name, s.work_tree_path, s.model, s.running_cost,
                    s.status, s.assistant_session_id, s.created_at, s.updated_at, s.ended_at
             FROM sessions s
             JOIN session_users su ON su.session_id = s.id
             WHERE su.user_id = ?1
             ORDER BY s.created_at DESC, s.id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn transition_session_status(
        &self,
        session_id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<bool> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp();
        let ended_at = to.is_terminal().then_some(now);
        let updated = conn.execute(
            &format!(
                "UPDATE sessions
                 SET status = ?1, updated_at = ?2, ended_at = COALESCE(?3, ended_at)
                 WHERE session_id = ?4 AND status IN ({})",
                status_list(from)
            ),
            params![to.as_str(), now, ended_at, session_id],
        )?;
        Ok(updated > 0)
    }

    fn add_session_cost(&self, session_id: &str, delta: f64) -> Result<f64> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(anyhow!("Refusing non-monotonic cost update {delta} for {session_id}"));
        }
        let conn = self.get_conn()?;
        let total = conn
            .query_row(
                "UPDATE sessions
                 SET running_cost = running_cost + ?1, updated_at = ?2
                 WHERE session_id = ?3
                 RETURNING running_cost",
                params![delta, Utc::now().timestamp(), session_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        total.ok_or_else(|| anyhow!("Session not found: {session_id}"))
    }

    fn touch_session(&self, session_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
            params![Utc::now().timestamp(), session_id],
        )?;
        Ok(())
    }

    fn set_assistant_session_id(&self, session_id: &str, token: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET assistant_session_id = ?1 WHERE session_id = ?2",
            params![token, session_id],
        )?;
        Ok(())
    }

    fn update_session_scope(&self, session_id: &str, scope: &ChatScope) -> Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE sessions
             SET workspace_id = ?1, channel_id = ?2, thread_ts = ?3, updated_at = ?4
             WHERE session_id = ?5",
            params![
                scope.workspace_id,
                scope.channel_id,
                scope.thread_key(),
                Utc::now().timestamp(),
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("Session not found: {session_id}"));
        }
        Ok(())
    }

    fn add_session_member(
        &self,
        session_row_id: i64,
        user_id: i64,
        role: SessionRole,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        insert_member(&conn, session_row_id, user_id, role)
    }

    fn remove_session_member(&self, session_row_id: i64, user_id: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM session_users WHERE session_id = ?1 AND user_id = ?2 AND role != 'owner'",
            params![session_row_id, user_id],
        )?;
        Ok(removed > 0)
    }

    fn get_session_owner(&self, session_row_id: i64) -> Result<i64> {
        let conn = self.get_conn()?;
        let owner = conn.query_row(
            "SELECT user_id FROM session_users WHERE session_id = ?1 AND role = 'owner'",
            params![session_row_id],
            |row| row.get(0),
        )?;
        Ok(owner)
    }

    fn get_member_role(&self, session_row_id: i64, user_id: i64) -> Result<Option<SessionRole>> {
        let conn = self.get_conn()?;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM session_users WHERE session_id = ?1 AND user_id = ?2",
                params![session_row_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        role.map(|r| r.parse::<SessionRole>().map_err(|e| anyhow!(e)))
            .transpose()
    }

    fn list_session_members(&self, session_row_id: i64) -> Result<Vec<SessionMember>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, role FROM session_users
             WHERE session_id = ?1 ORDER BY role = 'owner' DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_row_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut members = Vec::new();
        for row in rows {
            let (session_row_id, user_id, role) = row?;
            members.push(SessionMember {
                session_row_id,
                user_id,
                role: role.parse().map_err(|e: String| anyhow!(e))?,
            });
        }
        Ok(members)
    }

    fn record_session_message(
        &self,
        session_row_id: i64,
        direction: MessageDirection,
        content: &str,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO session_messages (session_id, direction, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_row_id,
                direction.as_str(),
                content,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    fn list_session_messages(
        &self,
        session_row_id: i64,
        limit: usize,
    ) -> Result<Vec<SessionMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, direction, content, created_at FROM (
                SELECT id, session_id, direction, content, created_at FROM session_messages
                WHERE session_id = ?1
                ORDER BY id DESC
                LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_row_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, session_row_id, direction, content, created_at) = row?;
            messages.push(SessionMessage {
                id,
                session_row_id,
                direction: direction.parse().map_err(|e: String| anyhow!(e))?,
                content,
                created_at: from_epoch_lossy(created_at),
            });
        }
        Ok(messages)
    }
}

/// Connection-level helpers so multi-row writes can share one transaction.
pub fn insert_session(conn: &Connection, session: &Session) -> Result<i64> {
    conn.execute(
        "INSERT INTO sessions (
            session_id, workspace_id, channel_id, thread_ts, repo_url,
            from_commitish, branch_name, work_tree_path, model, running_cost,
            status, assistant_session_id, created_at, updated_at, ended_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            session.session_id,
            session.workspace_id,
            session.channel_id,
            session.thread_ts.as_deref().unwrap_or(""),
            session.repo_url,
            session.from_commitish,
            session.branch_name,
            session.work_tree_path.to_string_lossy(),
            session.model,
            session.running_cost,
            session.status.as_str(),
            session.assistant_session_id,
            session.created_at.timestamp(),
            session.updated_at.timestamp(),
            session.ended_at.map(|t| t.timestamp()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_member(
    conn: &Connection,
    session_row_id: i64,
    user_id: i64,
    role: SessionRole,
) -> Result<()> {
    conn.execute(
        "INSERT INTO session_users (session_id, user_id, role, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_id, user_id) DO UPDATE SET role = excluded.role",
        params![session_row_id, user_id, role.as_str(), Utc::now().timestamp()],
    )?;
    Ok(())
}

pub fn branch_taken(conn: &Connection, branch_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE branch_name = ?1",
        params![branch_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn open_session_in_scope(conn: &Connection, scope: &ChatScope) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE workspace_id = ?1 AND channel_id = ?2 AND thread_ts = ?3
                   AND status IN ('starting', 'active')
                 LIMIT 1"
            ),
            params![scope.workspace_id, scope.channel_id, scope.thread_key()],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

pub fn count_open_sessions_owned_by(conn: &Connection, user_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sessions s
         JOIN session_users su ON su.session_id = s.id
         WHERE su.user_id = ?1 AND su.role = 'owner' AND s.status IN ('starting', 'active')",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// True when the error is a UNIQUE/constraint violation raised by SQLite.
pub fn is_constraint_violation(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<rusqlite::Error>()
        .and_then(|e| e.sqlite_error_code())
        .is_some_and(|code| code == rusqlite::ErrorCode::ConstraintViolation)
}

fn status_list(statuses: &[SessionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let thread: String = row.get(4)?;
    let path: String = row.get(8)?;
    let status: String = row.get(11)?;
    Ok(Session {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workspace_id: row.get(2)?,
        channel_id: row.get(3)?,
        thread_ts: (!thread.is_empty()).then_some(thread),
        repo_url: row.get(5)?,
        from_commitish: row.get(6)?,
        branch_name: row.get(7)?,
        work_tree_path: PathBuf::from(path),
        model: row.get(9)?,
        running_cost: row.get(10)?,
        status: status.parse().unwrap_or_else(|e| {
            log::warn!("[database] {e}; treating session as errored");
            SessionStatus::Error
        }),
        assistant_session_id: row.get(12)?,
        created_at: from_epoch_lossy(row.get(13)?),
        updated_at: from_epoch_lossy(row.get(14)?),
        ended_at: from_epoch_lossy_opt(row.get(15)?),
    })
}
