use crate::config::{AssistantConfig, SessionConfig};
use crate::domains::git::service::{check_repo_url_format, is_valid_branch_name};
use crate::domains::sessions::entity::CreateSessionRequest;
use crate::errors::BridgeError;

const FORBIDDEN_FEATURE_CHARS: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];

/// Feature names become branch names and workspace directory names.
pub fn validate_feature_name(name: &str) -> Result<(), BridgeError> {
    let reject = |reason: &str| {
        Err(BridgeError::invalid_command(format!(
            "feature name '{name}' {reason}"
        )))
    };

    if name.is_empty() {
        return reject("is empty");
    }
    if name.chars().any(char::is_whitespace) {
        return reject("must not contain whitespace");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return reject("must not start or end with '-'");
    }
    if name.contains("..") {
        return reject("must not contain '..'");
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_FEATURE_CHARS.contains(c)) {
        return reject(&format!("must not contain '{c}'"));
    }
    if !is_valid_branch_name(name) {
        return reject("is not a valid branch name");
    }
    Ok(())
}

/// Checks that need no I/O, in the order users should hear about them.
pub fn validate_create_request(
    request: &CreateSessionRequest,
    session: &SessionConfig,
    assistant: &AssistantConfig,
) -> Result<(), BridgeError> {
    let required = [
        ("workspace", request.workspace_id.as_str()),
        ("channel", request.channel_id.as_str()),
        ("repository URL", request.repo_url.as_str()),
        ("starting commit", request.from_commitish.as_str()),
        ("feature name", request.feature_name.as_str()),
        ("model", request.model.as_str()),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();
    if request.user_id <= 0 {
        return Err(BridgeError::invalid_command("a requesting user is required"));
    }
    if !missing.is_empty() {
        return Err(BridgeError::invalid_command(format!(
            "missing {}",
            missing.join(", ")
        )));
    }

    if !assistant.allows_model(&request.model) {
        return Err(BridgeError::invalid_command(format!(
            "model '{}' is not allowed; choose one of: {}",
            request.model,
            assistant.models.join(", ")
        )));
    }

    validate_feature_name(&request.feature_name)?;

    if session
        .reserved_channels
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(request.channel_id.trim_start_matches('#')))
    {
        return Err(BridgeError::InvalidChannel {
            channel_id: request.channel_id.clone(),
        });
    }

    let has_text = request.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
    let has_name = request
        .prompt_name
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if has_text && has_name {
        return Err(BridgeError::invalid_command(
            "give either a prompt or a prompt name, not both",
        ));
    }

    check_repo_url_format(&request.repo_url).map_err(BridgeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            workspace_id: "T1".into(),
            user_id: 7,
            channel_id: "C-dev".into(),
            thread_ts: None,
            repo_url: "https://github.com/acme/widgets.git".into(),
            from_commitish: "main".into(),
            feature_name: "my-feature".into(),
            model: "sonnet".into(),
            prompt: None,
            prompt_name: None,
        }
    }

    fn check(request: &CreateSessionRequest) -> Result<(), BridgeError> {
        validate_create_request(
            request,
            &SessionConfig::default(),
            &AssistantConfig::default(),
        )
    }

    #[test]
    fn feature_name_table() {
        let cases = [
            ("my-feature", true),
            ("fix/login-flow", true),
            ("feature_2", true),
            ("", false),
            ("-bad", false),
            ("bad-", false),
            ("has space", false),
            ("a..b", false),
            ("a~b", false),
            ("a^b", false),
            ("a:b", false),
            ("a?b", false),
            ("a*b", false),
            ("a[b", false),
            ("a\\b", false),
            ("name.lock", false),
        ];
        for (name, valid) in cases {
            assert_eq!(
                validate_feature_name(name).is_ok(),
                valid,
                "unexpected result for {name:?}"
            );
        }
    }

    #[test]
    fn complete_request_passes() {
        check(&request()).unwrap();
    }

    #[test]
    fn missing_fields_are_listed() {
        let mut req = request();
        req.repo_url = " ".into();
        req.model.clear();
        let err = check(&req).unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
        let text = err.to_string();
        assert!(text.contains("repository URL") && text.contains("model"), "{text}");
    }

    #[test]
    fn model_must_be_in_allowed_set() {
        let mut req = request();
        req.model = "gpt-5".into();
        assert!(check(&req).unwrap_err().to_string().contains("sonnet, opus"));
    }

    #[test]
    fn general_channel_is_reserved() {
        let mut req = request();
        req.channel_id = "general".into();
        assert_eq!(
            check(&req).unwrap_err(),
            BridgeError::InvalidChannel {
                channel_id: "general".into()
            }
        );
    }

    #[test]
    fn prompt_and_prompt_name_are_exclusive() {
        let mut req = request();
        req.prompt = Some("Be brief".into());
        req.prompt_name = Some("reviewer".into());
        assert_eq!(check(&req).unwrap_err().code(), "INVALID_COMMAND");

        req.prompt_name = Some("  ".into());
        check(&req).unwrap();
    }

    #[test]
    fn malformed_repo_url_is_rejected() {
        let mut req = request();
        req.repo_url = "widgets".into();
        assert_eq!(check(&req).unwrap_err().code(), "INVALID_COMMAND");
    }
}
