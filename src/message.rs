use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single role-tagged turn in the conversation buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            artifact: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, artifact: Value, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            artifact: Some(artifact),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Outcome of one tool execution.
///
/// `summary` is always human readable; `artifact` is whatever the tool returned and is
/// left for the caller to interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub summary: String,
    pub artifact: Value,
    pub tool_call_id: String,
}

impl ToolResult {
    pub fn to_message(&self) -> Message {
        Message::tool(&self.summary, self.artifact.clone(), &self.tool_call_id)
    }

    /// Artifact rendered for prompts: strings verbatim, everything else as compact JSON.
    pub fn artifact_text(&self) -> String {
        match &self.artifact {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_message_carries_artifact_and_id() {
        let result = ToolResult {
            summary: "Completed executing tool echo({})".into(),
            artifact: json!({"echo": 1}),
            tool_call_id: "__runtime__.echo".into(),
        };
        let message = result.to_message();
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.artifact, Some(json!({"echo": 1})));
        assert_eq!(message.tool_call_id.as_deref(), Some("__runtime__.echo"));
    }

    #[test]
    fn plain_messages_skip_optional_fields() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn artifact_text_keeps_strings_verbatim() {
        let result = ToolResult {
            summary: String::new(),
            artifact: json!("12:00"),
            tool_call_id: String::new(),
        };
        assert_eq!(result.artifact_text(), "12:00");
    }
}
