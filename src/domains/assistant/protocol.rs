use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One line of assistant output, decoded permissively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    System {
        subtype: String,
        session_id: Option<String>,
        tools: Vec<String>,
    },
    Assistant {
        text: Option<String>,
        session_id: Option<String>,
        message: Value,
    },
    User {
        session_id: Option<String>,
        message: Value,
    },
    Result(TurnResult),
    Raw {
        line: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    ErrorMaxTurns,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    pub cost_usd: Option<f64>,
    pub result: Option<String>,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<f64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default, alias = "total_cost_usd")]
    cost_usd: Option<f64>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSystem {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
}

impl StreamMessage {
    pub fn parse(line: &str) -> StreamMessage {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let raw = || StreamMessage::Raw {
            line: trimmed.to_string(),
        };

        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return raw();
        };
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return raw();
        };

        match kind {
            "system" => match serde_json::from_value::<RawSystem>(value.clone()) {
                Ok(system) => StreamMessage::System {
                    subtype: system.subtype.unwrap_or_default(),
                    session_id: system.session_id,
                    tools: system.tools,
                },
                Err(err) => {
                    log::debug!("[assistant] Malformed system message: {err}");
                    raw()
                }
            },
            "assistant" => {
                let message = value.get("message").cloned().unwrap_or(Value::Null);
                StreamMessage::Assistant {
                    text: extract_text(&message),
                    session_id: string_field(&value, "session_id"),
                    message,
                }
            }
            "user" => StreamMessage::User {
                session_id: string_field(&value, "session_id"),
                message: value.get("message").cloned().unwrap_or(Value::Null),
            },
            "result" => match serde_json::from_value::<RawResult>(value.clone()) {
                Ok(result) => StreamMessage::Result(TurnResult {
                    outcome: match result.subtype.as_deref() {
                        Some("success") | None => TurnOutcome::Success,
                        Some("error_max_turns") => TurnOutcome::ErrorMaxTurns,
                        Some(other) => TurnOutcome::Other(other.to_string()),
                    },
                    cost_usd: result.cost_usd,
                    result: result.result,
                    is_error: result.is_error,
                    num_turns: result.num_turns,
                    duration_ms: result.duration_ms,
                    session_id: result.session_id,
                }),
                Err(err) => {
                    log::debug!("[assistant] Malformed result message: {err}");
                    raw()
                }
            },
            _ => raw(),
        }
    }

    /// Continuation token announced by `system/init`.
    pub fn continuation_token(&self) -> Option<&str> {
        match self {
            StreamMessage::System {
                subtype,
                session_id: Some(token),
                ..
            } if subtype == "init" => Some(token),
            _ => None,
        }
    }

    /// Text worth showing in chat, if any.
    pub fn display_text(&self) -> Option<String> {
        match self {
            StreamMessage::Assistant { text, .. } => text.clone(),
            StreamMessage::Result(result) => match (&result.outcome, &result.result) {
                (_, Some(text)) if !text.trim().is_empty() => Some(text.clone()),
                (TurnOutcome::ErrorMaxTurns, _) => {
                    Some("Stopped: the assistant reached its maximum number of turns.".to_string())
                }
                _ => None,
            },
            StreamMessage::Raw { line } if !line.trim().is_empty() => Some(line.clone()),
            _ => None,
        }
    }
}

impl TurnResult {
    pub fn cost(&self) -> f64 {
        self.cost_usd
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputFormat {
    #[default]
    StreamJson,
    Text,
}

/// Encodes one user message as a single input line.
pub fn encode_user_message(message: &str, format: InputFormat) -> String {
    match format {
        InputFormat::StreamJson => json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": message }],
            },
        })
        .to_string(),
        InputFormat::Text => message.replace(['\r', '\n'], " "),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn extract_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_text_is_forwarded_raw() {
        let msg = StreamMessage::parse("Compiling widgets v0.1.0\r\n");
        assert_eq!(
            msg,
            StreamMessage::Raw {
                line: "Compiling widgets v0.1.0".into()
            }
        );
        assert_eq!(msg.display_text().as_deref(), Some("Compiling widgets v0.1.0"));
    }

    #[test]
    fn unknown_type_and_non_object_json_are_raw() {
        assert!(matches!(
            StreamMessage::parse(r#"{"type":"stream_event","delta":1}"#),
            StreamMessage::Raw { .. }
        ));
        assert!(matches!(StreamMessage::parse("[1,2,3]"), StreamMessage::Raw { .. }));
        assert!(matches!(StreamMessage::parse("42"), StreamMessage::Raw { .. }));
    }

    #[test]
    fn init_message_carries_continuation_token() {
        let msg = StreamMessage::parse(
            r#"{"type":"system","subtype":"init","session_id":"abc-123","tools":["Bash","Edit"]}"#,
        );
        assert_eq!(msg.continuation_token(), Some("abc-123"));

        let other = StreamMessage::parse(r#"{"type":"system","subtype":"compact","session_id":"x"}"#);
        assert_eq!(other.continuation_token(), None);
    }

    #[test]
    fn success_result_exposes_cost_and_text() {
        let msg = StreamMessage::parse(
            r#"{"type":"result","subtype":"success","cost_usd":0.0035,"result":"Done","is_error":false,"num_turns":2,"session_id":"abc"}"#,
        );
        let StreamMessage::Result(result) = msg else {
            panic!("expected result");
        };
        assert_eq!(result.outcome, TurnOutcome::Success);
        assert_eq!(result.cost(), 0.0035);
        assert_eq!(result.result.as_deref(), Some("Done"));
        assert_eq!(result.num_turns, Some(2));
    }

    #[test]
    fn max_turns_still_surfaces_partial_cost() {
        let msg = StreamMessage::parse(
            r#"{"type":"result","subtype":"error_max_turns","total_cost_usd":0.41,"is_error":true}"#,
        );
        let StreamMessage::Result(result) = &msg else {
            panic!("expected result");
        };
        assert_eq!(result.outcome, TurnOutcome::ErrorMaxTurns);
        assert_eq!(result.cost(), 0.41);
        assert!(msg.display_text().unwrap().contains("maximum number of turns"));
    }

    #[test]
    fn assistant_text_blocks_are_joined() {
        let msg = StreamMessage::parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"one"},{"type":"tool_use","name":"Bash"},{"type":"text","text":"two"}]}}"#,
        );
        assert_eq!(msg.display_text().as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn user_messages_encode_to_single_lines() {
        let json_line = encode_user_message("fix the\nbuild", InputFormat::StreamJson);
        assert!(!json_line.contains('\n'));
        let parsed: Value = serde_json::from_str(&json_line).unwrap();
        assert_eq!(parsed["message"]["content"][0]["text"], "fix the\nbuild");

        assert_eq!(encode_user_message("a\nb", InputFormat::Text), "a b");
    }
}
