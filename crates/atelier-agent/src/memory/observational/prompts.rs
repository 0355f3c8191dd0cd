//! Observer and Reflector prompt templates.

use atelier::chat::ChatMessage;
use once_cell::sync::Lazy;
use regex::Regex;

pub const OBSERVER_SYSTEM_PROMPT: &str = r#"You are an Observation Agent that creates dense, structured memory records for an AI coding assistant.

You will receive:
- EXISTING OBSERVATIONS (if any): the current observation log
- NEW MESSAGES: recent conversation messages not yet observed

Your task is to update or create the observation log to include the new messages.

## Output Format

Use this exact structure:

Date: <today's date, e.g. "February 19, 2026">

🔴 **Critical** (must never be lost):
- Item description
  - Supporting detail or file path

🟡 **Important** (key decisions, tool results, current state):
- Item description
  - Supporting detail

🟢 **Background** (context, resolved issues, preferences):
- Item description

<current-task>
One sentence describing exactly what the agent is working on right now.
</current-task>

<suggested-response>
One or two sentences the agent should use to continue naturally, e.g. "Continue implementing the JWT validation middleware in auth/middleware.rs starting at the validate_token function."
</suggested-response>

## Rules

1. **Preserve ALL specifics verbatim**: file paths, function names, error messages, variable names, line numbers
2. **Priority assignment**:
   - 🔴 Critical: Unresolved errors, blocking issues, user's explicit constraints ("never do X"), security concerns
   - 🟡 Important: Completed tool results, key architectural decisions, current implementation state, recent file edits
   - 🟢 Background: Resolved problems, general context, project overview, preferences
3. **When merging with existing observations**: add new items, promote items if their status changed, demote resolved issues to 🟢
4. **Temporal anchoring**: Note dates for time-sensitive info ("as of Feb 19", "2 hours ago")
5. **Compression target**: 3-6x compression vs raw messages while retaining all actionable details
6. **Two-level bullets**: top level = event/task/decision, sub-bullets = file paths, values, specifics
7. **Do NOT include** conversation pleasantries, redundant clarifications, or information that has been superseded"#;

pub const REFLECTOR_SYSTEM_PROMPT: &str = r#"You are a Reflection Agent that condenses and restructures an existing observation log for an AI coding assistant.

The observation log has grown too large. Your task is to restructure it to be more compact while preserving all critical information.

## Compression Rules

1. **NEVER drop** 🔴 Critical items unless they are explicitly resolved (then move to 🟢 with resolution note)
2. **Merge related items**: combine 3 similar tool results into one bullet with sub-bullets
3. **Drop superseded info**: if a bug was fixed, keep only the fix, not the original bug report
4. **Keep temporal anchors**: preserve dates and time references for important events
5. **Preserve ALL specifics verbatim**: file paths, function names, error messages
6. **Restructure**: reorganize bullets by theme/component rather than chronological order
7. **Target**: reduce token count by 40-60% while retaining all 🔴 and 🟡 items

## Output Format

Use the same format as the input:

Date: <date>

🔴 **Critical**:
- ...

🟡 **Important**:
- ...

🟢 **Background**:
- ...

<current-task>
...
</current-task>

<suggested-response>
...
</suggested-response>"#;

pub const OBSERVATION_CONTINUATION_HINT: &str = "This message is not from the user. Conversation \
    history was compacted into <observations> due to context limits. Continue naturally from \
    prior context. Do not greet as if this is a new conversation.";

/// Build the Observer prompt. `prior_chunks` are included only as dedup
/// context for passive chunk runs.
pub fn build_observer_prompt(
    existing_observation: Option<&str>,
    new_messages: &[ChatMessage],
    today: &str,
    prior_chunks: Option<&[String]>,
) -> Vec<ChatMessage> {
    let existing_section = match existing_observation {
        Some(existing) => format!("## Existing Observations\n\n{}\n", existing),
        None => "## Existing Observations\n\n(none — this is the first observation)\n".to_string(),
    };

    let prior_section = match prior_chunks {
        Some(chunks) if !chunks.is_empty() => {
            let blocks: Vec<String> = chunks
                .iter()
                .enumerate()
                .map(|(i, text)| format!("### Prior Chunk {}\n{}", i + 1, text))
                .collect();
            format!(
                "## Recent Observation Chunks (for reference — DO NOT repeat)\n\n\
                 The following chunks were recently generated from earlier messages in this \
                 conversation. Use them ONLY as context to avoid duplicating information. \
                 Do NOT restate facts, decisions, or details already captured below.\n\n{}\n",
                blocks.join("\n\n")
            )
        }
        _ => String::new(),
    };

    let new_messages_text: Vec<String> = new_messages
        .iter()
        .map(|m| format!("[{}]: {}", m.role.as_str(), m.content))
        .collect();

    let user_content = format!(
        "Today's date: {}\n\n{}\n{}\n## New Messages to Observe\n\n{}\n\n---\n\n\
         Generate updated observations incorporating all new messages. Maintain the exact \
         output format specified.",
        today,
        existing_section,
        prior_section,
        new_messages_text.join("\n\n")
    );

    vec![
        ChatMessage::system(OBSERVER_SYSTEM_PROMPT),
        ChatMessage::user(user_content),
    ]
}

pub fn build_reflector_prompt(observation_content: &str) -> Vec<ChatMessage> {
    let user_content = format!(
        "## Current Observation Log (too large, needs compression)\n\n{}\n\n---\n\n\
         Restructure and compress the above observations. Target: reduce by 40-60% while \
         preserving all 🔴 Critical items and all specific details (file paths, function \
         names, error messages).",
        observation_content
    );
    vec![
        ChatMessage::system(REFLECTOR_SYSTEM_PROMPT),
        ChatMessage::user(user_content),
    ]
}

static CURRENT_TASK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<current-task>\s*(.*?)\s*</current-task>").unwrap());
static SUGGESTED_RESPONSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<suggested-response>\s*(.*?)\s*</suggested-response>").unwrap());

/// Split Observer/Reflector output into
/// (content, current_task, suggested_response). The tagged sections are
/// removed from the content and returned as separate fields.
pub fn parse_observation_output(raw: &str) -> (String, Option<String>, Option<String>) {
    let current_task = CURRENT_TASK
        .captures(raw)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    let suggested_response = SUGGESTED_RESPONSE
        .captures(raw)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    let content = CURRENT_TASK.replace_all(raw, "");
    let content = SUGGESTED_RESPONSE.replace_all(&content, "");
    (content.trim().to_string(), current_task, suggested_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_and_strips_tagged_sections() {
        let raw = "Date: today\n\n🔴 **Critical**:\n- broken build\n\n<current-task>\nFix the build\n</current-task>\n\n<suggested-response>\nContinue fixing src/lib.rs\n</suggested-response>";
        let (content, task, response) = parse_observation_output(raw);
        assert!(content.contains("broken build"));
        assert!(!content.contains("current-task"));
        assert_eq!(task.as_deref(), Some("Fix the build"));
        assert_eq!(response.as_deref(), Some("Continue fixing src/lib.rs"));
    }

    #[test]
    fn parse_without_tags_keeps_content() {
        let (content, task, response) = parse_observation_output("just observations");
        assert_eq!(content, "just observations");
        assert!(task.is_none());
        assert!(response.is_none());
    }

    #[test]
    fn observer_prompt_includes_existing_and_prior_chunks() {
        let chunks = vec!["earlier chunk".to_string()];
        let messages = vec![ChatMessage::user("new info")];
        let prompt = build_observer_prompt(Some("old log"), &messages, "August 01, 2026", Some(&chunks));
        assert_eq!(prompt.len(), 2);
        let user = &prompt[1].content;
        assert!(user.contains("old log"));
        assert!(user.contains("Prior Chunk 1"));
        assert!(user.contains("[user]: new info"));
        assert!(user.contains("August 01, 2026"));
    }

    #[test]
    fn first_observation_prompt_notes_absence() {
        let prompt = build_observer_prompt(None, &[ChatMessage::user("x")], "today", None);
        assert!(prompt[1].content.contains("(none — this is the first observation)"));
    }
}
