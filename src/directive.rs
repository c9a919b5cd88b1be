//! Parsing tool directives out of free-form model output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Location hint for callables registered at runtime rather than through a module.
pub const RUNTIME_MODULE: &str = "__runtime__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
    Module,
    Mcp,
}

/// A structured tool invocation emitted by the model.
///
/// For `mcp` directives `module_path` holds the remote server id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDirective {
    pub tool_name: String,
    pub tool_type: ToolType,
    pub arguments: Map<String, Value>,
    pub module_path: String,
}

impl ToolDirective {
    /// Returns `None` whenever the content is not an actionable directive.
    ///
    /// Accepted: a JSON object (bare, fenced, or embedded in prose) carrying every
    /// required field with a non-empty `tool_name`. Content that is exactly `None`
    /// or `{}` means the model chose not to call a tool.
    pub fn parse(content: &str) -> Option<Self> {
        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed == "None" || trimmed == "{}" {
            return None;
        }
        let candidate = extract_json_object(trimmed)?;
        match serde_json::from_str::<ToolDirective>(candidate) {
            Ok(directive) if !directive.tool_name.trim().is_empty() => Some(directive),
            Ok(_) => {
                debug!("directive has an empty tool_name; treating as no tool call");
                None
            }
            Err(err) => {
                debug!(error = %err, "content is not a tool directive");
                None
            }
        }
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }

    /// `name({...})` rendering used in summaries and continuation prompts.
    pub fn call_signature(&self) -> String {
        format!("{}({})", self.tool_name, self.arguments_value())
    }
}

/// Returns the first balanced `{...}` object in `text`, honouring JSON string escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runtime_directive() {
        let directive = ToolDirective::parse(
            r#"{"tool_name":"get_current_time","tool_type":"function","arguments":{},"module_path":"__runtime__"}"#,
        )
        .unwrap();

        assert_eq!(directive.tool_name, "get_current_time");
        assert_eq!(directive.tool_type, ToolType::Function);
        assert_eq!(directive.module_path, RUNTIME_MODULE);
        assert!(directive.arguments.is_empty());
    }

    #[test]
    fn parses_directive_wrapped_in_fence_and_prose() {
        let content = "Sure, calling it now:\n```json\n{\"tool_name\": \"quote\", \"tool_type\": \"module\", \"arguments\": {\"symbol\": \"{AAPL}\"}, \"module_path\": \"finance.stocks\"}\n```";
        let directive = ToolDirective::parse(content).unwrap();
        assert_eq!(directive.module_path, "finance.stocks");
        assert_eq!(directive.arguments["symbol"], "{AAPL}");
    }

    #[test]
    fn missing_fields_mean_no_tool_call() {
        assert!(ToolDirective::parse(r#"{"tool_name":"x","arguments":{}}"#).is_none());
        assert!(ToolDirective::parse(
            r#"{"tool_name":"","tool_type":"function","arguments":{},"module_path":"m"}"#
        )
        .is_none());
        assert!(ToolDirective::parse(
            r#"{"tool_name":"x","tool_type":"shell","arguments":{},"module_path":"m"}"#
        )
        .is_none());
    }

    #[test]
    fn plain_text_and_sentinels_mean_no_tool_call() {
        assert!(ToolDirective::parse("2 + 2 = 4").is_none());
        assert!(ToolDirective::parse("None").is_none());
        assert!(ToolDirective::parse(" {} ").is_none());
        assert!(ToolDirective::parse("{\"tool_name\": \"broken\"").is_none());
    }

    #[test]
    fn word_none_inside_arguments_does_not_suppress_directive() {
        let directive = ToolDirective::parse(
            r#"{"tool_name":"search","tool_type":"module","arguments":{"q":"None of the above"},"module_path":"web"}"#,
        );
        assert!(directive.is_some());
    }

    #[test]
    fn extracts_first_balanced_object() {
        let text = r#"prefix {"a": "}", "b": {"c": 1}} trailing {"d": 2}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"a": "}", "b": {"c": 1}}"#)
        );
        assert_eq!(extract_json_object("no braces"), None);
    }
}
