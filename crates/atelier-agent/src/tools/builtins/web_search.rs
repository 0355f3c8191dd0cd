//! Web search: fetch pre-extracted context from the Brave LLM-context
//! endpoint and summarize it with a non-streaming provider call.

use async_trait::async_trait;
use atelier::chat::{ChatMessage, ChatRequest};
use serde_json::{Value, json};

use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome};

const BRAVE_LLM_CONTEXT_URL: &str = "https://api.search.brave.com/res/v1/llm/context";
const GROUNDING_CHAR_BUDGET: usize = 6000;
const SUMMARY_SYSTEM_PROMPT: &str = "You are a concise summarizer. Given web search results and \
    the user's query, produce a succinct report (2-5 paragraphs). Cite key facts and sources.";

/// Format grounding items into text for the summarizer.
fn format_grounding(generic: &[Value]) -> String {
    let mut parts = Vec::new();
    for item in generic {
        let url = item.get("url").and_then(Value::as_str).unwrap_or("");
        let title = item.get("title").and_then(Value::as_str).unwrap_or("");
        let snippets: Vec<&str> = item
            .get("snippets")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if snippets.is_empty() {
            continue;
        }
        let mut block = format!("[{}]({})\n", title, url);
        for snippet in snippets {
            block.push_str(&format!("  {}\n", snippet));
        }
        parts.push(block);
    }
    parts.join("\n")
}

fn truncate_grounding(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[Truncated for length...]", &text[..end])
}

pub struct WebSearchTool {
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and get a summarized report with sources. Pass the search query in \
         'q' (1-400 characters). Use for current information the codebase cannot answer."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["q"],
            "properties": {
                "q": {"type": "string", "description": "Search query"},
                "maximum_number_of_tokens": {
                    "type": "integer",
                    "description": "Token budget for retrieved context",
                    "default": 8192
                }
            }
        })
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let q = args
            .get("q")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if q.is_empty() {
            return Ok(ToolOutcome::failure("Error: q (search query) is required."));
        }
        if q.len() > 400 {
            return Ok(ToolOutcome::failure("Error: q must be 1-400 characters."));
        }
        let Some(services) = ctx.services.as_ref() else {
            return Ok(ToolOutcome::failure("web_search requires service context"));
        };
        let api_key = services.settings.brave_api_key.clone();
        if api_key.is_empty() {
            return Ok(ToolOutcome::failure(
                "Web search API key not configured. Add it in settings.",
            ));
        }

        let max_tokens = args
            .get("maximum_number_of_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(8192)
            .clamp(1024, 32_768);

        let max_tokens_param = max_tokens.to_string();
        let response = self
            .client
            .get(BRAVE_LLM_CONTEXT_URL)
            .query(&[
                ("q", q.as_str()),
                ("maximum_number_of_tokens", max_tokens_param.as_str()),
            ])
            .header("X-Subscription-Token", &api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("search request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Ok(ToolOutcome::failure(format!(
                "Web search API error ({}): {}",
                status, snippet
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("bad search response: {}", e)))?;

        let generic = body
            .get("grounding")
            .and_then(|g| g.get("generic"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let grounding = format_grounding(&generic);
        if grounding.trim().is_empty() {
            return Ok(ToolOutcome::success(format!("No web results found for: {}", q)));
        }
        let grounding = truncate_grounding(&grounding, GROUNDING_CHAR_BUDGET);

        let request = ChatRequest::new(
            services.settings.sub_agent_model(),
            vec![
                ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
                ChatMessage::user(format!("Query: {}\n\nSearch results:\n\n{}", q, grounding)),
            ],
        )
        .with_sampling(1024, 0.2);

        match services.provider.chat(&request).await {
            Ok(summary) if !summary.trim().is_empty() => Ok(ToolOutcome::success(summary)),
            // Raw grounding is still useful when the summarizer is down.
            Ok(_) | Err(_) => Ok(ToolOutcome::success(grounding)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounding_formats_titles_urls_and_snippets() {
        let generic = vec![json!({
            "url": "https://example.com/a",
            "title": "Example",
            "snippets": ["first fact", "second fact"]
        })];
        let text = format_grounding(&generic);
        assert!(text.contains("[Example](https://example.com/a)"));
        assert!(text.contains("  first fact"));
    }

    #[test]
    fn items_without_snippets_are_dropped() {
        let generic = vec![json!({"url": "u", "title": "t", "snippets": []})];
        assert!(format_grounding(&generic).is_empty());
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(10_000);
        let truncated = truncate_grounding(&long, 100);
        assert!(truncated.len() < 200);
        assert!(truncated.ends_with("[Truncated for length...]"));
    }
}
