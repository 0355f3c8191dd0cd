//! Token-budgeted project directory overview.
//!
//! Walks the project tree up to three levels (ignoring hidden and vendor
//! directories) and renders an indented listing. If the rendering blows the
//! token budget at depth 3, depth 2 and then depth 1 are tried before
//! giving up and using the shallowest listing.

use std::path::Path;

use atelier::tokens;

use crate::paths::is_ignored_dir;
use crate::preprocess::ContextMessage;

pub const PROJECT_OVERVIEW_MAX_DEPTH: usize = 3;
pub const PROJECT_OVERVIEW_TOKEN_TARGET: usize = 2000;

fn walk_levels(root: &Path, depth: usize, max_depth: usize, out: &mut Vec<String>) {
    if depth >= max_depth {
        return;
    }
    let Ok(entries) = std::fs::read_dir(root) else {
        out.push(format!("{}(error reading directory)", "  ".repeat(depth)));
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || is_ignored_dir(&name) {
            continue;
        }
        let indent = "  ".repeat(depth);
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            out.push(format!("{}{}/", indent, name));
            walk_levels(&entry.path(), depth + 1, max_depth, out);
        } else {
            out.push(format!("{}{}", indent, name));
        }
    }
}

/// Render the overview text for `root`, shrinking depth to fit the budget.
pub fn build_overview(root: &Path, token_target: usize) -> Option<String> {
    if !root.is_dir() {
        return None;
    }
    let mut fallback: Option<String> = None;
    for max_depth in (1..=PROJECT_OVERVIEW_MAX_DEPTH).rev() {
        let mut lines = Vec::new();
        walk_levels(root, 0, max_depth, &mut lines);
        if lines.is_empty() {
            return None;
        }
        let text = format!(
            "Project root: {}\n\nAll file paths in tool calls (read_file, edit_file, list_files, \
             grep, execute_command cwd) must be absolute paths under this root.\n\n\
             Project structure (first {} directory level{}):\n\n{}",
            root.display(),
            max_depth,
            if max_depth == 1 { "" } else { "s" },
            lines.join("\n")
        );
        if tokens::count_text(&text) <= token_target {
            return Some(text);
        }
        fallback = Some(text);
    }
    // Even depth 1 is over budget; better an oversized listing than none.
    fallback
}

/// Insert the overview as a system message after any leading system
/// messages. No-op when the project path is unset or unreadable.
pub fn apply_project_overview(
    messages: &mut Vec<ContextMessage>,
    project_path: Option<&str>,
    token_target: usize,
) {
    let Some(path) = project_path else {
        return;
    };
    let root = Path::new(path);
    let Some(overview) = build_overview(root, token_target) else {
        return;
    };
    let insert_at = messages
        .iter()
        .position(|m| m.role != atelier::chat::ChatRole::System)
        .unwrap_or(messages.len());
    messages.insert(insert_at, ContextMessage::system(overview));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/deep/deeper")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/junk")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("README.md"), "# readme").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("src/deep/mod.rs"), "").unwrap();
        std::fs::write(root.join("src/deep/deeper/leaf.rs"), "").unwrap();
        dir
    }

    #[test]
    fn overview_lists_three_levels_and_skips_vendor_dirs() {
        let dir = fixture();
        let text = build_overview(dir.path(), 100_000).unwrap();
        assert!(text.contains("README.md"));
        assert!(text.contains("src/"));
        assert!(text.contains("deep/"));
        // Depth 3 lists deeper/ but not its children.
        assert!(text.contains("deeper/"));
        assert!(!text.contains("leaf.rs"));
        assert!(!text.contains("node_modules"));
        assert!(!text.contains(".git"));
    }

    #[test]
    fn tight_budget_falls_back_to_shallower_depth() {
        let dir = fixture();
        let deep = build_overview(dir.path(), 100_000).unwrap();
        let shallow = build_overview(dir.path(), 40).unwrap();
        assert!(shallow.len() <= deep.len());
        assert!(shallow.contains("level)") || shallow.contains("levels)"));
    }

    #[test]
    fn missing_root_yields_none() {
        assert!(build_overview(Path::new("/definitely/not/here"), 1000).is_none());
    }

    #[test]
    fn overview_inserts_after_system_prompt() {
        let dir = fixture();
        let mut messages = vec![
            ContextMessage::system("prompt"),
            ContextMessage::user("hello"),
        ];
        apply_project_overview(&mut messages, Some(dir.path().to_str().unwrap()), 100_000);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "prompt");
        assert!(messages[1].content.starts_with("Project root:"));
        assert_eq!(messages[2].content, "hello");
    }
}
