//! Project plan persistence: markdown files with revision rows, optimistic
//! conflict detection, and an approval flow.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{ChatEventKind, PlanOut};
use crate::history::plan_out;
use crate::ids::{generate_id, utc_now_iso};
use crate::store::ChatStore;
use crate::store::domain::{ProjectPlanRevisionRow, ProjectPlanRow};

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap());

pub fn content_sha(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Plan markdown lives at `project_plans/<projectId>/plans/<planId>.md`,
/// written atomically via tempfile + rename.
pub struct PlanFileStore {
    root: PathBuf,
}

impl PlanFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, project_id: &str, plan_id: &str) -> PathBuf {
        self.root
            .join(project_id)
            .join("plans")
            .join(format!("{}.md", plan_id))
    }

    pub fn write(&self, project_id: &str, plan_id: &str, content: &str) -> Result<PathBuf, AgentError> {
        let path = self.path_for(project_id, plan_id);
        let parent = path.parent().expect("plan path has a parent");
        std::fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn read(&self, path: &str) -> Result<String, AgentError> {
        Ok(std::fs::read_to_string(path)?)
    }
}

fn normalize_heading_label(label: &str) -> String {
    label.trim_start_matches('#').trim().to_lowercase()
}

fn replace_markdown_section(markdown: &str, heading: &str, body: &str) -> String {
    let target = normalize_heading_label(heading);
    if target.is_empty() {
        return markdown.to_string();
    }
    let lines: Vec<&str> = markdown.lines().collect();

    let mut start_idx = None;
    let mut start_level = 0usize;
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = HEADING.captures(line.trim()) {
            let level = caps.get(1).unwrap().as_str().len();
            if normalize_heading_label(caps.get(2).unwrap().as_str()) == target {
                start_idx = Some(idx);
                start_level = level;
                break;
            }
        }
    }

    let Some(start_idx) = start_idx else {
        let mut out = markdown.trim_end().to_string();
        out.push_str(&format!("\n\n## {}\n", heading.trim()));
        if !body.trim().is_empty() {
            out.push_str(&format!("{}\n", body.trim_end()));
        }
        return out;
    };

    let mut end_idx = lines.len();
    for (idx, line) in lines.iter().enumerate().skip(start_idx + 1) {
        if let Some(caps) = HEADING.captures(line.trim()) {
            if caps.get(1).unwrap().as_str().len() <= start_level {
                end_idx = idx;
                break;
            }
        }
    }

    let mut out: Vec<String> = lines[..start_idx].iter().map(|s| s.to_string()).collect();
    out.push(lines[start_idx].to_string());
    out.push(String::new());
    if !body.trim().is_empty() {
        out.extend(body.trim_end().lines().map(str::to_string));
    }
    out.extend(lines[end_idx..].iter().map(|s| s.to_string()));
    format!("{}\n", out.join("\n").trim_end())
}

fn extract_patch_ops(model_output: &str) -> Option<Vec<Value>> {
    let text = model_output.trim();
    if text.is_empty() {
        return None;
    }
    let parsed: Option<Value> = serde_json::from_str(text).ok().or_else(|| {
        static FENCED: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(\{[\s\S]*\})\s*```").unwrap());
        FENCED
            .captures(text)
            .and_then(|caps| serde_json::from_str(caps.get(1).unwrap().as_str()).ok())
    });
    let payload = parsed?;
    let ops = payload.get("ops")?.as_array()?;
    Some(ops.iter().filter(|op| op.is_object()).cloned().collect())
}

/// Apply a plan-edit model output: either raw replacement markdown, or a
/// JSON `{"ops": [...]}` patch with replace_all / replace_section /
/// append_section operations.
pub fn apply_plan_edit_output(current_markdown: &str, model_output: &str) -> String {
    let Some(ops) = extract_patch_ops(model_output) else {
        let candidate = model_output.trim();
        return if candidate.is_empty() {
            current_markdown.to_string()
        } else {
            candidate.to_string()
        };
    };

    let mut updated = current_markdown.to_string();
    for op in ops {
        let name = op.get("op").and_then(Value::as_str).unwrap_or("").trim();
        let heading = op.get("heading").and_then(Value::as_str);
        let content = op.get("content").and_then(Value::as_str);
        match (name, heading, content) {
            ("replace_all", _, Some(content)) if !content.trim().is_empty() => {
                updated = format!("{}\n", content.trim());
            }
            ("replace_section", Some(heading), Some(content)) => {
                updated = replace_markdown_section(&updated, heading, content);
            }
            ("append_section", Some(heading), Some(content)) => {
                updated = format!(
                    "{}\n\n## {}\n{}\n",
                    updated.trim_end(),
                    heading.trim(),
                    content.trim()
                );
            }
            _ => {}
        }
    }
    updated
}

pub struct PlanUpdateResult {
    pub plan: PlanOut,
    pub conflict: bool,
}

pub struct PlanService {
    store: ChatStore,
    files: PlanFileStore,
    event_bus: Arc<EventBus>,
}

impl PlanService {
    pub fn new(store: ChatStore, files: PlanFileStore, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            files,
            event_bus,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_plan(
        &self,
        chat_id: &str,
        checkpoint_id: Option<&str>,
        content: &str,
        title: &str,
        status: &str,
        last_editor: &str,
    ) -> Result<PlanOut, AgentError> {
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| AgentError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;
        let plan_id = generate_id("plan");
        let path = self.files.write(&chat.project_id, &plan_id, content)?;
        let now = utc_now_iso();
        let row = ProjectPlanRow {
            id: plan_id.clone(),
            chat_id: chat_id.to_string(),
            project_id: chat.project_id.clone(),
            checkpoint_id: checkpoint_id.map(str::to_string),
            title: title.to_string(),
            status: status.to_string(),
            file_path: path.display().to_string(),
            revision: 1,
            content_sha: content_sha(content),
            last_editor: last_editor.to_string(),
            approved_action: None,
            implementation_chat_id: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        self.store.create_plan(row.clone()).await?;
        self.store
            .add_plan_revision(ProjectPlanRevisionRow {
                id: generate_id("rev"),
                plan_id: plan_id.clone(),
                revision: 1,
                content_sha: row.content_sha.clone(),
                last_editor: last_editor.to_string(),
                checkpoint_id: checkpoint_id.map(str::to_string),
                timestamp: now,
            })
            .await?;

        let out = plan_out(&row, Some(content.to_string()));
        self.event_bus
            .publish(chat_id, ChatEventKind::PlanReady { plan: out.clone() });
        Ok(out)
    }

    pub async fn get_plan(
        &self,
        chat_id: &str,
        plan_id: &str,
        include_content: bool,
    ) -> Result<PlanOut, AgentError> {
        let row = self.load_plan(chat_id, plan_id).await?;
        let content = if include_content {
            Some(self.files.read(&row.file_path)?)
        } else {
            None
        };
        Ok(plan_out(&row, content))
    }

    /// Update the plan content. `base_revision` is the revision the caller
    /// edited against; a mismatch means someone else updated the plan in
    /// the meantime and the write is refused as a conflict.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_plan(
        &self,
        chat_id: &str,
        plan_id: &str,
        content: &str,
        base_revision: i64,
        last_editor: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<PlanUpdateResult, AgentError> {
        let mut row = self.load_plan(chat_id, plan_id).await?;
        if row.revision != base_revision {
            let out = plan_out(&row, None);
            self.event_bus.publish(
                chat_id,
                ChatEventKind::PlanConflict {
                    plan: out.clone(),
                    reason: "stale_revision".to_string(),
                },
            );
            return Ok(PlanUpdateResult {
                plan: out,
                conflict: true,
            });
        }

        self.files.write(&row.project_id, &row.id, content)?;
        row.revision += 1;
        row.content_sha = content_sha(content);
        row.last_editor = last_editor.to_string();
        row.updated_at = utc_now_iso();
        if checkpoint_id.is_some() {
            row.checkpoint_id = checkpoint_id.map(str::to_string);
        }
        self.store.update_plan(row.clone()).await?;
        self.store
            .add_plan_revision(ProjectPlanRevisionRow {
                id: generate_id("rev"),
                plan_id: row.id.clone(),
                revision: row.revision,
                content_sha: row.content_sha.clone(),
                last_editor: last_editor.to_string(),
                checkpoint_id: checkpoint_id.map(str::to_string),
                timestamp: row.updated_at.clone(),
            })
            .await?;

        let out = plan_out(&row, Some(content.to_string()));
        self.event_bus
            .publish(chat_id, ChatEventKind::PlanUpdated { plan: out.clone() });
        Ok(PlanUpdateResult {
            plan: out,
            conflict: false,
        })
    }

    /// Re-read the markdown from disk when an external editor touched it,
    /// recording a revision for the change.
    pub async fn sync_external_if_needed(&self, chat_id: &str, plan_id: &str) -> Result<(), AgentError> {
        let row = self.load_plan(chat_id, plan_id).await?;
        let on_disk = match self.files.read(&row.file_path) {
            Ok(content) => content,
            Err(_) => return Ok(()),
        };
        if content_sha(&on_disk) == row.content_sha {
            return Ok(());
        }
        self.update_plan(chat_id, plan_id, &on_disk, row.revision, "external", None)
            .await?;
        Ok(())
    }

    pub async fn approve_plan(
        &self,
        chat_id: &str,
        plan_id: &str,
        action: &str,
        implementation_chat_id: Option<&str>,
    ) -> Result<PlanOut, AgentError> {
        let mut row = self.load_plan(chat_id, plan_id).await?;
        row.status = "approved".to_string();
        row.approved_action = Some(action.to_string());
        row.implementation_chat_id = implementation_chat_id.map(str::to_string);
        row.updated_at = utc_now_iso();
        self.store.update_plan(row.clone()).await?;

        let out = plan_out(&row, None);
        self.event_bus
            .publish(chat_id, ChatEventKind::PlanApproved { plan: out.clone() });
        Ok(out)
    }

    pub async fn list_plans(&self, chat_id: &str) -> Result<Vec<PlanOut>, AgentError> {
        Ok(self
            .store
            .list_plans(chat_id)
            .await?
            .iter()
            .map(|p| plan_out(p, None))
            .collect())
    }

    async fn load_plan(&self, chat_id: &str, plan_id: &str) -> Result<ProjectPlanRow, AgentError> {
        self.store
            .get_plan(plan_id)
            .await?
            .filter(|p| p.chat_id == chat_id)
            .ok_or_else(|| AgentError::Validation(format!("Plan not found: {}", plan_id)))
    }
}

impl PlanFileStore {
    /// Used by tests and external sync to check file placement.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::seed_chat;

    async fn service_fixture() -> (tempfile::TempDir, ChatStore, Arc<EventBus>, PlanService, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::connect_in_memory().await.unwrap();
        let (_, chat) = seed_chat(&store).await;
        let bus = Arc::new(EventBus::new());
        let service = PlanService::new(
            store.clone(),
            PlanFileStore::new(dir.path().join("project_plans")),
            bus.clone(),
        );
        (dir, store, bus, service, chat.id)
    }

    #[tokio::test]
    async fn create_writes_markdown_and_revision_row() {
        let (_dir, store, bus, service, chat_id) = service_fixture().await;
        let mut sub = bus.subscribe(&chat_id);

        let plan = service
            .create_plan(&chat_id, Some("cp-1"), "# Plan\n\ndo things\n", "Implementation Plan", "ready", "agent")
            .await
            .unwrap();

        assert_eq!(plan.revision, 1);
        assert_eq!(plan.status, "ready");
        assert_eq!(std::fs::read_to_string(&plan.file_path).unwrap(), "# Plan\n\ndo things\n");
        assert!(plan.file_path.contains("plans"));
        assert_eq!(store.list_plan_revisions(&plan.id).await.unwrap().len(), 1);

        let event = sub.receiver.try_recv().unwrap();
        assert_eq!(event.kind.type_name(), "plan_ready");
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let (_dir, _store, bus, service, chat_id) = service_fixture().await;
        let plan = service
            .create_plan(&chat_id, None, "# P\n", "Plan", "ready", "agent")
            .await
            .unwrap();
        let mut sub = bus.subscribe(&chat_id);

        // First writer bumps to revision 2.
        let first = service
            .update_plan(&chat_id, &plan.id, "# P v2\n", 1, "user", None)
            .await
            .unwrap();
        assert!(!first.conflict);
        // Second writer still bases on revision 1.
        let second = service
            .update_plan(&chat_id, &plan.id, "# P conflicting\n", 1, "agent", None)
            .await
            .unwrap();
        assert!(second.conflict);

        let kinds: Vec<String> = std::iter::from_fn(|| sub.receiver.try_recv().ok())
            .map(|e| e.kind.type_name().to_string())
            .collect();
        assert_eq!(kinds, vec!["plan_updated", "plan_conflict"]);
    }

    #[tokio::test]
    async fn approve_sets_status_and_action() {
        let (_dir, _store, bus, service, chat_id) = service_fixture().await;
        let plan = service
            .create_plan(&chat_id, None, "# P\n", "Plan", "ready", "agent")
            .await
            .unwrap();
        let mut sub = bus.subscribe(&chat_id);

        let approved = service
            .approve_plan(&chat_id, &plan.id, "implement", Some("chat-2"))
            .await
            .unwrap();
        assert_eq!(approved.status, "approved");
        assert_eq!(approved.approved_action.as_deref(), Some("implement"));
        assert_eq!(approved.implementation_chat_id.as_deref(), Some("chat-2"));
        assert_eq!(sub.receiver.try_recv().unwrap().kind.type_name(), "plan_approved");
    }

    #[test]
    fn replace_section_swaps_only_that_section() {
        let md = "# Title\n\n## Goals\n\nold goals\n\n## Steps\n\nstep one\n";
        let updated = replace_markdown_section(md, "Goals", "new goals");
        assert!(updated.contains("new goals"));
        assert!(!updated.contains("old goals"));
        assert!(updated.contains("step one"));
    }

    #[test]
    fn missing_section_is_appended() {
        let md = "# Title\n";
        let updated = replace_markdown_section(md, "Risks", "watch out");
        assert!(updated.contains("## Risks"));
        assert!(updated.contains("watch out"));
    }

    #[test]
    fn plan_edit_output_accepts_raw_markdown_and_ops_json() {
        let current = "# Plan\n\n## Goals\n\nold\n";
        // Raw markdown replaces wholesale.
        assert_eq!(apply_plan_edit_output(current, "# New Plan\n"), "# New Plan");

        // Ops JSON patches sections.
        let ops = r#"{"ops":[{"op":"replace_section","heading":"Goals","content":"fresh"}]}"#;
        let patched = apply_plan_edit_output(current, ops);
        assert!(patched.contains("fresh"));
        assert!(!patched.contains("old"));

        // Fenced ops JSON also parses.
        let fenced = format!("```json\n{}\n```", ops);
        assert!(apply_plan_edit_output(current, &fenced).contains("fresh"));

        // Empty output keeps the current plan.
        assert_eq!(apply_plan_edit_output(current, "   "), current);
    }

    #[test]
    fn content_sha_is_stable_hex() {
        let a = content_sha("same input");
        let b = content_sha("same input");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(content_sha("other"), a);
    }
}
