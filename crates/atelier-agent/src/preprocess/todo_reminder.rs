//! Append the current todo list as a reminder block on the last user
//! message, replacing any block from a previous iteration.

use async_trait::async_trait;
use atelier::chat::{ChatProvider, ChatRole};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AgentError;
use crate::preprocess::{Preprocessor, PromptContext};
use crate::store::ChatStore;

static ENV_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\n*<environment_details>[\s\S]*?</environment_details>\s*").unwrap()
});

pub struct TodoReminderPreprocessor {
    store: ChatStore,
}

impl TodoReminderPreprocessor {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }
}

fn clip_content(content: &str) -> String {
    let escaped = content.replace('|', "\\|");
    if escaped.chars().count() > 80 {
        let clipped: String = escaped.chars().take(80).collect();
        format!("{}...", clipped)
    } else {
        escaped
    }
}

fn title_case_status(status: &str) -> String {
    status
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Preprocessor for TodoReminderPreprocessor {
    fn name(&self) -> &str {
        "todo_reminder"
    }

    fn priority(&self) -> u8 {
        12
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        let todos = self.store.list_todos(&ctx.chat_id).await?;

        let Some(last_user_idx) = ctx
            .messages
            .iter()
            .rposition(|m| m.role == ChatRole::User)
        else {
            return Ok(());
        };

        let message = &mut ctx.messages[last_user_idx];
        let mut content = ENV_BLOCK.replace_all(&message.content, "").to_string();

        if !todos.is_empty() {
            let mut lines = vec![
                "<environment_details>".to_string(),
                "REMINDERS".to_string(),
                String::new(),
                "Below is your current list of reminders for this task. Keep them updated as you progress.".to_string(),
                String::new(),
                "| # | Content | Status |".to_string(),
                "|---|---------|--------|".to_string(),
            ];
            for (i, todo) in todos.iter().enumerate() {
                lines.push(format!(
                    "| {} | {} | {} |",
                    i + 1,
                    clip_content(&todo.content),
                    title_case_status(&todo.status)
                ));
            }
            lines.push(String::new());
            lines.push(
                "IMPORTANT: When task status changes, remember to call the `update_todo_list` tool to update your progress."
                    .to_string(),
            );
            lines.push("When done, call `submit_task` to end the agent loop.".to_string());
            lines.push("</environment_details>".to_string());
            content = format!("{}\n\n{}", content.trim_end(), lines.join("\n"));
        }
        message.content = content;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ContextMessage;
    use crate::test_utils::{NullProvider, seed_chat};

    #[tokio::test]
    async fn appends_reminder_table_to_last_user_message() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        store
            .replace_todos(
                &chat.id,
                None,
                vec![
                    ("ship feature".into(), "in_progress".into(), 0),
                    ("write docs".into(), "pending".into(), 1),
                ],
            )
            .await
            .unwrap();

        let pp = TodoReminderPreprocessor::new(store);
        let mut ctx = PromptContext::new(
            chat.id.clone(),
            vec![
                ContextMessage::user("first"),
                ContextMessage::assistant("reply"),
                ContextMessage::user("latest ask"),
            ],
            "m",
            1000,
        );
        pp.process(&mut ctx, &NullProvider).await.unwrap();

        assert!(!ctx.messages[0].content.contains("environment_details"));
        let last = &ctx.messages[2].content;
        assert!(last.starts_with("latest ask"));
        assert!(last.contains("<environment_details>"));
        assert!(last.contains("| 1 | ship feature | In Progress |"));
        assert!(last.contains("submit_task"));
    }

    #[tokio::test]
    async fn stale_block_is_replaced_not_stacked() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        store
            .replace_todos(&chat.id, None, vec![("only".into(), "pending".into(), 0)])
            .await
            .unwrap();

        let pp = TodoReminderPreprocessor::new(store);
        let mut ctx = PromptContext::new(
            chat.id.clone(),
            vec![ContextMessage::user(
                "ask\n\n<environment_details>\nOLD BLOCK\n</environment_details>",
            )],
            "m",
            1000,
        );
        pp.process(&mut ctx, &NullProvider).await.unwrap();

        let content = &ctx.messages[0].content;
        assert!(!content.contains("OLD BLOCK"));
        assert_eq!(content.matches("<environment_details>").count(), 1);
    }

    #[tokio::test]
    async fn empty_todo_list_strips_stale_block() {
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;

        let pp = TodoReminderPreprocessor::new(store);
        let mut ctx = PromptContext::new(
            chat.id.clone(),
            vec![ContextMessage::user(
                "ask\n\n<environment_details>\nOLD\n</environment_details>",
            )],
            "m",
            1000,
        );
        pp.process(&mut ctx, &NullProvider).await.unwrap();
        assert!(!ctx.messages[0].content.contains("environment_details"));
    }
}
