//! Token estimation.
//!
//! Uses the cl100k_base tiktoken encoding when it can be constructed and
//! falls back to the chars/4 heuristic otherwise, so estimation never fails.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::chat::ChatMessage;

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::cl100k_base().ok());

/// Count tokens in a piece of text.
pub fn count_text(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => (text.len() / 4).max(1),
    }
}

/// Count tokens across a message list, including tool-call payloads.
pub fn count_messages(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| {
            let mut total = count_text(&m.content);
            if let Some(calls) = &m.tool_calls {
                for call in calls {
                    total += count_text(&call.function.name);
                    total += count_text(&call.function.arguments);
                }
            }
            total
        })
        .sum()
}

/// Return the first `preview_tokens` and last `preview_tokens` of `text`,
/// joined by a truncation marker. Returns the text unchanged when it fits
/// inside a single preview window on each side.
pub fn extract_preview_by_tokens(text: &str, preview_tokens: usize) -> String {
    if let Some(bpe) = ENCODER.as_ref() {
        let tokens = bpe.encode_with_special_tokens(text);
        if tokens.len() <= preview_tokens * 2 {
            return text.to_string();
        }
        let head = bpe
            .decode(tokens[..preview_tokens].to_vec())
            .unwrap_or_else(|_| char_preview_head(text, preview_tokens));
        let tail = bpe
            .decode(tokens[tokens.len() - preview_tokens..].to_vec())
            .unwrap_or_else(|_| char_preview_tail(text, preview_tokens));
        return format!("{}\n\n... [truncated] ...\n\n{}", head.trim_end(), tail.trim_start());
    }

    let budget_chars = preview_tokens * 4;
    if text.len() <= budget_chars * 2 {
        return text.to_string();
    }
    format!(
        "{}\n\n... [truncated] ...\n\n{}",
        char_preview_head(text, preview_tokens).trim_end(),
        char_preview_tail(text, preview_tokens).trim_start()
    )
}

fn char_preview_head(text: &str, preview_tokens: usize) -> String {
    let budget = preview_tokens * 4;
    let mut end = budget.min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[..end].to_string()
}

fn char_preview_tail(text: &str, preview_tokens: usize) -> String {
    let budget = preview_tokens * 4;
    let mut start = text.len().saturating_sub(budget);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_text(""), 0);
    }

    #[test]
    fn count_grows_with_text() {
        let short = count_text("hello");
        let long = count_text(&"hello world ".repeat(100));
        assert!(long > short);
        assert!(short >= 1);
    }

    #[test]
    fn messages_include_tool_call_arguments() {
        let plain = vec![ChatMessage::user("run it")];
        let with_call = vec![ChatMessage::assistant_with_tool_calls(
            "run it",
            vec![crate::ToolCall::function(
                "c1",
                "grep",
                "{\"pattern\": \"needle in a very long haystack of arguments\"}",
            )],
        )];
        assert!(count_messages(&with_call) > count_messages(&plain));
    }

    #[test]
    fn preview_keeps_short_text_intact() {
        assert_eq!(extract_preview_by_tokens("short", 500), "short");
    }

    #[test]
    fn preview_truncates_long_text() {
        let text = "line of filler content here\n".repeat(2000);
        let preview = extract_preview_by_tokens(&text, 50);
        assert!(preview.len() < text.len());
        assert!(preview.contains("[truncated]"));
        assert!(preview.starts_with("line of filler"));
        assert!(preview.trim_end().ends_with("content here"));
    }
}
