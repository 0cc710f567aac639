use super::connection::Database;
use super::timestamps::from_epoch_lossy;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub workspace_id: String,
    pub external_user_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Anthropic,
    Github,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Anthropic => "anthropic",
            CredentialType::Github => "github",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(CredentialType::Anthropic),
            "github" => Ok(CredentialType::Github),
            other => Err(anyhow!("Unknown credential type '{other}'")),
        }
    }
}

pub trait UserMethods {
    fn create_or_update_user(
        &self,
        workspace_id: &str,
        external_user_id: &str,
        display_name: &str,
    ) -> Result<User>;
    fn get_user(&self, id: i64) -> Result<User>;
    fn get_user_by_external_id(&self, workspace_id: &str, external_user_id: &str) -> Result<User>;
}

pub trait CredentialMethods {
    fn store_credential(&self, user_id: i64, kind: CredentialType, value: &str) -> Result<()>;
    fn get_credential(&self, user_id: i64, kind: CredentialType) -> Result<Option<String>>;
    fn delete_credential(&self, user_id: i64, kind: CredentialType) -> Result<bool>;
    fn has_required_credentials(&self, user_id: i64) -> Result<bool>;
}

const USER_COLUMNS: &str =
    "id, workspace_id, external_user_id, display_name, created_at, updated_at";

impl UserMethods for Database {
    fn create_or_update_user(
        &self,
        workspace_id: &str,
        external_user_id: &str,
        display_name: &str,
    ) -> Result<User> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO users (workspace_id, external_user_id, display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(workspace_id, external_user_id) DO UPDATE SET
                display_name = excluded.display_name,
                updated_at = excluded.updated_at",
            params![workspace_id, external_user_id, display_name, now],
        )?;

        let user = conn.query_row(
            &format!(
                "SELECT {USER_COLUMNS} FROM users WHERE workspace_id = ?1 AND external_user_id = ?2"
            ),
            params![workspace_id, external_user_id],
            row_to_user,
        )?;
        Ok(user)
    }

    fn get_user(&self, id: i64) -> Result<User> {
        let conn = self.get_conn()?;
        let user = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            row_to_user,
        )?;
        Ok(user)
    }

    fn get_user_by_external_id(&self, workspace_id: &str, external_user_id: &str) -> Result<User> {
        let conn = self.get_conn()?;
        let user = conn.query_row(
            &format!(
                "SELECT {USER_COLUMNS} FROM users WHERE workspace_id = ?1 AND external_user_id = ?2"
            ),
            params![workspace_id, external_user_id],
            row_to_user,
        )?;
        Ok(user)
    }
}

impl CredentialMethods for Database {
    fn store_credential(&self, user_id: i64, kind: CredentialType, value: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO credentials (user_id, credential_type, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id, credential_type) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![user_id, kind.as_str(), value, now],
        )?;
        Ok(())
    }

    fn get_credential(&self, user_id: i64, kind: CredentialType) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM credentials WHERE user_id = ?1 AND credential_type = ?2",
                params![user_id, kind.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_credential(&self, user_id: i64, kind: CredentialType) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND credential_type = ?2",
            params![user_id, kind.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn has_required_credentials(&self, user_id: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE user_id = ?1 AND credential_type = ?2",
            params![user_id, CredentialType::Anthropic.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        external_user_id: row.get(2)?,
        display_name: row.get(3)?,
        created_at: from_epoch_lossy(row.get(4)?),
        updated_at: from_epoch_lossy(row.get(5)?),
    })
}
