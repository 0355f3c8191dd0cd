//! Spillover of oversized tool output to disk.
//!
//! Outputs past the token threshold are written under
//! `tool_outputs/projects/<projectId>/<uuid>.txt`; the in-prompt content is
//! replaced by a first+last token preview plus an instruction pointing at
//! the absolute path. A [`SpillRecord`] describes the persisted artifact for
//! the caller to turn into a ToolArtifact row.

use std::path::{Path, PathBuf};

use atelier::tokens;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SpillRecord {
    pub artifact_type: String,
    pub file_path: String,
    pub line_count: i64,
    pub preview_lines: i64,
}

#[derive(Debug, Clone)]
pub struct SpillResult {
    /// Preview + read_file instruction; the original output when no spill
    pub content: String,
    pub record: Option<SpillRecord>,
    pub total_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    max_tokens: usize,
    preview_tokens: usize,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, max_tokens: usize, preview_tokens: usize) -> Self {
        Self {
            root,
            max_tokens,
            preview_tokens,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    /// Spill `output` when it exceeds the token threshold.
    ///
    /// Failure to write is downgraded to a no-spill result; the turn must
    /// not die because the disk was full.
    pub fn materialize_tool_output(&self, output: &str, project_id: &str) -> SpillResult {
        let total_tokens = tokens::count_text(output);
        if total_tokens <= self.max_tokens {
            return SpillResult {
                content: output.to_string(),
                record: None,
                total_tokens,
            };
        }

        let dir = self.project_dir(project_id);
        let out_path = dir.join(format!("{}.txt", Uuid::new_v4().simple()));
        if let Err(err) = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&out_path, output)) {
            log::warn!("failed to spill tool output to {}: {}", out_path.display(), err);
            return SpillResult {
                content: output.to_string(),
                record: None,
                total_tokens,
            };
        }

        let abs_path = out_path
            .canonicalize()
            .unwrap_or_else(|_| out_path.clone())
            .display()
            .to_string();
        let preview = tokens::extract_preview_by_tokens(output, self.preview_tokens);
        let instruction = format!(
            "The preceding tool output was truncated ({} tokens). Full output saved to: {}. \
             Use read_file to read sections as needed.",
            total_tokens, abs_path
        );

        SpillResult {
            content: format!("{}\n\n{}", preview, instruction),
            record: Some(SpillRecord {
                artifact_type: "tool_output".to_string(),
                file_path: abs_path,
                line_count: output.lines().count() as i64,
                preview_lines: self.preview_tokens as i64,
            }),
            total_tokens,
        }
    }

    pub fn delete_path(&self, path: &str) {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::debug!("failed to delete artifact path={}: {}", path, err);
            }
        }
    }

    /// Unlink every spill file belonging to a project.
    pub fn cleanup_project(&self, project_id: &str) {
        let dir = self.project_dir(project_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.path().is_file() {
                self.delete_path(&entry.path().display().to_string());
            }
        }
    }
}
