use super::connection::Database;
use super::timestamps::from_epoch_lossy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub content: String,
    pub is_public: bool,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait PromptMethods {
    fn save_system_prompt(
        &self,
        user_id: i64,
        name: &str,
        description: &str,
        content: &str,
        is_public: bool,
    ) -> Result<SystemPrompt>;
    /// The user's own prompt wins over a public prompt with the same name.
    fn find_system_prompt(&self, user_id: i64, name: &str) -> Result<Option<SystemPrompt>>;
    fn list_system_prompts(&self, user_id: i64) -> Result<Vec<SystemPrompt>>;
    fn delete_system_prompt(&self, user_id: i64, name: &str) -> Result<bool>;
}

const PROMPT_COLUMNS: &str =
    "id, name, description, content, is_public, created_by, created_at, updated_at";

impl PromptMethods for Database {
    fn save_system_prompt(
        &self,
        user_id: i64,
        name: &str,
        description: &str,
        content: &str,
        is_public: bool,
    ) -> Result<SystemPrompt> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO system_prompts (name, description, content, is_public, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(created_by, name) DO UPDATE SET
                description = excluded.description,
                content = excluded.content,
                is_public = excluded.is_public,
                updated_at = excluded.updated_at",
            params![name, description, content, is_public, user_id, now],
        )?;

        let prompt = conn.query_row(
            &format!("SELECT {PROMPT_COLUMNS} FROM system_prompts WHERE created_by = ?1 AND name = ?2"),
            params![user_id, name],
            row_to_prompt,
        )?;
        Ok(prompt)
    }

    fn find_system_prompt(&self, user_id: i64, name: &str) -> Result<Option<SystemPrompt>> {
        let conn = self.get_conn()?;
        let prompt = conn
            .query_row(
                &format!(
                    "SELECT {PROMPT_COLUMNS} FROM system_prompts
                     WHERE name = ?1 AND (created_by = ?2 OR is_public = TRUE)
                     ORDER BY (created_by = ?2) DESC, updated_at DESC
                     LIMIT 1"
                ),
                params![name, user_id],
                row_to_prompt,
            )
            .optional()?;
        Ok(prompt)
    }

    fn list_system_prompts(&self, user_id: i64) -> Result<Vec<SystemPrompt>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLUMNS} FROM system_prompts
             WHERE created_by = ?1 OR is_public = TRUE
             ORDER BY name ASC, (created_by = ?1) DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_prompt)?;
        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row?);
        }
        Ok(prompts)
    }

    fn delete_system_prompt(&self, user_id: i64, name: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM system_prompts WHERE created_by = ?1 AND name = ?2",
            params![user_id, name],
        )?;
        Ok(removed > 0)
    }
}

fn row_to_prompt(row: &Row) -> rusqlite::Result<SystemPrompt> {
    Ok(SystemPrompt {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        is_public: row.get(4)?,
        created_by: row.get(5)?,
        created_at: from_epoch_lossy(row.get(6)?),
        updated_at: from_epoch_lossy(row.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::UserMethods;

    #[test]
    fn own_prompt_shadows_public_prompt() {
        let db = Database::new_in_memory().expect("db");
        let alice = db.create_or_update_user("T1", "U1", "alice").unwrap();
        let bob = db.create_or_update_user("T1", "U2", "bob").unwrap();

        db.save_system_prompt(bob.id, "reviewer", "", "public review prompt", true)
            .unwrap();
        assert_eq!(
            db.find_system_prompt(alice.id, "reviewer")
                .unwrap()
                .unwrap()
                .content,
            "public review prompt"
        );

        db.save_system_prompt(alice.id, "reviewer", "", "private review prompt", false)
            .unwrap();
        assert_eq!(
            db.find_system_prompt(alice.id, "reviewer")
                .unwrap()
                .unwrap()
                .content,
            "private review prompt"
        );
    }

    #[test]
    fn private_prompts_are_invisible_to_others() {
        let db = Database::new_in_memory().expect("db");
        let alice = db.create_or_update_user("T1", "U1", "alice").unwrap();
        let bob = db.create_or_update_user("T1", "U2", "bob").unwrap();

        db.save_system_prompt(alice.id, "secret", "", "mine", false)
            .unwrap();

        assert!(db.find_system_prompt(bob.id, "secret").unwrap().is_none());
        assert!(db.list_system_prompts(bob.id).unwrap().is_empty());
        assert_eq!(db.list_system_prompts(alice.id).unwrap().len(), 1);

        assert!(db.delete_system_prompt(alice.id, "secret").unwrap());
        assert!(db.list_system_prompts(alice.id).unwrap().is_empty());
    }
}
