use crate::errors::BridgeError;
use crate::infrastructure::database::{Database, PromptMethods};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Claude Bot, a senior distributed systems \
engineer fluent in Go, Rust, Python, JavaScript, Java and C, with deep experience running \
cloud services on Linux. You think through trade-offs before settling on a solution, care about \
clear API boundaries and simple, maintainable designs, and use type systems to rule out whole \
classes of bugs. You have access to this git repository and help with coding, debugging, \
documentation and other development tasks. Be helpful, accurate and concise.";

#[derive(Debug, Clone, PartialEq)]
pub enum PromptSource {
    Literal(String),
    Named { name: String, content: String },
    Default,
}

impl PromptSource {
    pub fn text(&self) -> &str {
        match self {
            PromptSource::Literal(text) => text,
            PromptSource::Named { content, .. } => content,
            PromptSource::Default => DEFAULT_SYSTEM_PROMPT,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PromptSource::Literal(_) => "custom prompt".to_string(),
            PromptSource::Named { name, .. } => format!("saved prompt '{name}'"),
            PromptSource::Default => "default prompt".to_string(),
        }
    }
}

/// Literal text, else a saved prompt visible to the user, else the built-in default.
pub fn resolve_system_prompt(
    db: &Database,
    user_id: i64,
    prompt: Option<&str>,
    prompt_name: Option<&str>,
) -> Result<PromptSource, BridgeError> {
    if let Some(text) = prompt.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(PromptSource::Literal(text.to_string()));
    }

    if let Some(name) = prompt_name.map(str::trim).filter(|n| !n.is_empty()) {
        let saved = db
            .find_system_prompt(user_id, name)
            .map_err(BridgeError::database)?
            .ok_or_else(|| {
                BridgeError::invalid_command(format!("no saved prompt named '{name}'"))
            })?;
        return Ok(PromptSource::Named {
            name: saved.name,
            content: saved.content,
        });
    }

    Ok(PromptSource::Default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::UserMethods;

    #[test]
    fn resolution_order() {
        let db = Database::new_in_memory().unwrap();
        let alice = db.create_or_update_user("T1", "U1", "alice").unwrap();
        let bob = db.create_or_update_user("T1", "U2", "bob").unwrap();
        db.save_system_prompt(bob.id, "reviewer", "", "Review carefully", true)
            .unwrap();
        db.save_system_prompt(bob.id, "secret", "", "Bob only", false)
            .unwrap();

        let literal = resolve_system_prompt(&db, alice.id, Some(" Be terse "), None).unwrap();
        assert_eq!(literal, PromptSource::Literal("Be terse".into()));

        let named = resolve_system_prompt(&db, alice.id, None, Some("reviewer")).unwrap();
        assert_eq!(named.text(), "Review carefully");

        let hidden = resolve_system_prompt(&db, alice.id, None, Some("secret")).unwrap_err();
        assert_eq!(hidden.code(), "INVALID_COMMAND");

        let fallback = resolve_system_prompt(&db, alice.id, Some("  "), None).unwrap();
        assert_eq!(fallback, PromptSource::Default);
        assert!(fallback.text().starts_with("You are Claude Bot"));
    }
}
