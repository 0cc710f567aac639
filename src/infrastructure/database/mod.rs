pub mod connection;
pub mod db_prompts;
pub mod db_schema;
pub mod db_users;
pub mod timestamps;

pub use connection::Database;
pub use db_prompts::{PromptMethods, SystemPrompt};
pub use db_schema::initialize_schema;
pub use db_users::{CredentialMethods, CredentialType, User, UserMethods};
