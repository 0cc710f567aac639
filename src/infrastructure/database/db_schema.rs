use super::connection::Database;

pub fn initialize_schema(db: &Database) -> anyhow::Result<()> {
    let conn = db.get_conn()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id TEXT NOT NULL,
            external_user_id TEXT NOT NULL,
            display_name TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(workspace_id, external_user_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            credential_type TEXT NOT NULL,  -- 'anthropic' or 'github'
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(user_id, credential_type),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // thread_ts is '' for channel-pinned sessions so it participates in unique indexes
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL UNIQUE,
            workspace_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            thread_ts TEXT NOT NULL DEFAULT '',
            repo_url TEXT NOT NULL,
            from_commitish TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            work_tree_path TEXT NOT NULL,
            model TEXT NOT NULL,
            running_cost REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL,  -- 'starting', 'active', 'ending', 'ended', 'error'
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            ended_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_branch ON sessions(branch_name)",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_scope
         ON sessions(workspace_id, channel_id, thread_ts)
         WHERE status IN ('starting', 'active')",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_worktree
         ON sessions(work_tree_path)
         WHERE status IN ('starting', 'active', 'ending')",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL,  -- 'owner' or 'collaborator'
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, user_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_session_users_owner
         ON session_users(session_id) WHERE role = 'owner'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            direction TEXT NOT NULL,  -- 'user_to_assistant' or 'assistant_to_user'
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_messages_session
         ON session_messages(session_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            is_public BOOLEAN NOT NULL DEFAULT FALSE,
            created_by INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(created_by, name),
            FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;

    apply_sessions_migrations(&conn)?;

    Ok(())
}

fn apply_sessions_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    // Columns added after the first release; errors mean the column already exists.
    let _ = conn.execute(
        "ALTER TABLE sessions ADD COLUMN assistant_session_id TEXT",
        [],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_names(db: &Database, table: &str) -> Vec<String> {
        let conn = db.get_conn().unwrap();
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn schema_initialization_is_idempotent() {
        let db = Database::new_in_memory().expect("db");
        initialize_schema(&db).expect("second run");
        initialize_schema(&db).expect("third run");

        let columns = column_names(&db, "sessions");
        assert!(columns.contains(&"assistant_session_id".to_string()));
        assert!(columns.contains(&"running_cost".to_string()));
    }

    #[test]
    fn open_scope_index_ignores_terminal_sessions() {
        let db = Database::new_in_memory().expect("db");
        let conn = db.get_conn().unwrap();
        let insert = |sid: &str, branch: &str, status: &str| {
            conn.execute(
                "INSERT INTO sessions (session_id, workspace_id, channel_id, thread_ts, repo_url,
                    from_commitish, branch_name, work_tree_path, model, status, created_at, updated_at)
                 VALUES (?1, 'T', 'C', '', 'url', 'main', ?2, ?2, 'sonnet', ?3, 0, 0)",
                rusqlite::params![sid, branch, status],
            )
        };

        insert("a", "one", "ended").unwrap();
        insert("b", "two", "active").unwrap();
        assert!(insert("c", "three", "starting").is_err());
        assert!(insert("d", "one", "ended").is_err(), "branch names never reused");
    }
}
