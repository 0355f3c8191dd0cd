//! Auto-approve rule matching.

use serde_json::Value;

use crate::store::domain::AutoApproveRule;

/// Whether a tool call matches any enabled auto-approve rule.
///
/// Rule fields:
/// - `tool`: matches the tool name exactly
/// - `path`: matches the `path` input exactly
/// - `extension`: matches the extension of the `path` input (with dot)
/// - `directory`: prefix of the `path` input's directory
/// - `pattern`: substring of the serialized input payload
pub fn matches_auto_approve_rules(
    tool_name: &str,
    input_payload: &Value,
    rules: &[AutoApproveRule],
) -> bool {
    let path_value = input_payload
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let extension = match path_value.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => format!(".{}", ext),
        _ => String::new(),
    };
    let directory = path_value
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();
    let payload_text = input_payload.to_string();

    for rule in rules {
        if !rule.enabled {
            continue;
        }
        let matched = match rule.field.as_str() {
            "tool" => tool_name == rule.value,
            "path" => !path_value.is_empty() && path_value == rule.value,
            "extension" => !extension.is_empty() && extension == rule.value,
            "directory" => !directory.is_empty() && directory.starts_with(&rule.value),
            "pattern" => payload_text.contains(&rule.value),
            _ => false,
        };
        if matched {
            return true;
        }
    }
    false
}
