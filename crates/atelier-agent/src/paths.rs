//! Path resolution for tools operating within a project root.
//!
//! Tool path arguments must be absolute. Streaming models occasionally leak
//! JSON delimiters into path strings (`/src/Main.java"}`), so raw values are
//! sanitized before any security check runs.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AgentError;

/// Directory names ignored by grep, list_files and the project overview.
pub const IGNORED_DIR_NAMES: &[&str] = &[
    ".venv",
    "venv",
    ".env",
    "node_modules",
    "__pycache__",
    ".git",
    ".hg",
    ".svn",
    ".cache",
    "cache",
    "dist",
    "build",
    ".next",
    ".nuxt",
    ".output",
    "coverage",
    ".coverage",
    ".pytest_cache",
    ".mypy_cache",
    "target",
    ".tox",
    ".eggs",
];

const BLOCKED_PREFIXES: &[&str] = &[
    "/etc", "/var", "/usr", "/bin", "/sbin", "/boot", "/proc", "/sys", "/dev",
];

// A path ending in delimiter noise like `}}`, `]`, or `,`. A single trailing
// brace is kept (valid on POSIX); only multi-char clusters are trimmed.
static TRAILING_DELIMITER_CLUSTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<core>.+?)(?P<noise>[{}\[\],]+)$").unwrap());

// Quote+delimiter tails such as `path'}` or `path`}` from markdown/code
// formatting. Only strips when a quote character is present so legitimate
// names like `data}` survive.
static TRAILING_QUOTE_DELIMITER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(?P<path>.+?)(?P<noise>['"`][}\[\],]*|[}\[\],]*['"`][}\[\],]*)$"#).unwrap());

pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIR_NAMES.contains(&name)
}

/// Normalize path text from tool payloads before security checks.
pub fn sanitize_raw_path(raw_path: &str) -> String {
    let mut value = raw_path.trim().to_string();
    if value.is_empty() {
        return value;
    }

    let first = value.chars().next().unwrap();
    let last = value.chars().last().unwrap();
    if value.chars().count() >= 2 && first == last && matches!(first, '"' | '\'' | '`') {
        let inner: String = {
            let mut chars: Vec<char> = value.chars().collect();
            chars.remove(0);
            chars.pop();
            chars.into_iter().collect()
        };
        value = inner.trim().to_string();
    } else {
        let stripped = TRAILING_QUOTE_DELIMITER.captures(&value).and_then(|caps| {
            let core = caps.name("path").unwrap().as_str().trim_end();
            if core.is_empty() { None } else { Some(core.to_string()) }
        });
        if let Some(stripped) = stripped {
            value = stripped;
        }
        value = value
            .trim_end_matches([' ', '\t', '\r', '\n', ',', ';', '"', '\'', '`'])
            .to_string();
        if value.starts_with(['"', '\'', '`']) {
            value = value[1..].trim_start().to_string();
        }
    }

    let trimmed = TRAILING_DELIMITER_CLUSTER.captures(&value).and_then(|caps| {
        let noise = caps.name("noise").unwrap().as_str();
        if noise.len() < 2 {
            return None;
        }
        let core = caps.name("core").unwrap().as_str().trim_end();
        if core.is_empty() { None } else { Some(core.to_string()) }
    });
    if let Some(trimmed) = trimmed {
        value = trimmed;
    }
    value
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    tool_outputs_root: PathBuf,
}

impl PathResolver {
    pub fn new(tool_outputs_root: PathBuf) -> Self {
        Self { tool_outputs_root }
    }

    pub fn tool_outputs_root(&self) -> &Path {
        &self.tool_outputs_root
    }

    /// Resolve an absolute path with security checks.
    ///
    /// Symlinks are resolved when the target exists; the real path must not
    /// sit under a blocked system prefix, and — unless `allow_external` —
    /// must be inside `project_root` or the tool-outputs directory.
    pub fn resolve(
        &self,
        raw_path: &str,
        project_root: Option<&Path>,
        allow_external: bool,
    ) -> Result<PathBuf, AgentError> {
        let normalized = sanitize_raw_path(raw_path);
        if normalized.is_empty() {
            return Err(AgentError::Validation("path is required".to_string()));
        }
        let target = PathBuf::from(&normalized);
        if !target.is_absolute() {
            return Err(AgentError::Validation(
                "Path must be absolute. Use the project root path from the project overview \
                 (e.g. /path/to/project/src/main.rs)."
                    .to_string(),
            ));
        }

        // Canonicalize through the deepest existing ancestor so paths about
        // to be created still get symlink resolution on their parents.
        let target = canonicalize_lenient(&target);

        for prefix in BLOCKED_PREFIXES {
            if target.starts_with(prefix) {
                return Err(AgentError::Validation(format!(
                    "Access denied: {} is in a restricted directory",
                    normalized
                )));
            }
        }

        if target.starts_with(&self.tool_outputs_root) {
            return Ok(target);
        }
        if allow_external {
            return Ok(target);
        }
        if let Some(root) = project_root {
            let base = canonicalize_lenient(root);
            if !target.starts_with(&base) {
                return Err(AgentError::Validation(format!(
                    "Path {} is outside the project root. Only paths under {} are allowed.",
                    normalized,
                    base.display()
                )));
            }
        }
        Ok(target)
    }
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    let mut existing = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                suffix.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut real = existing.canonicalize().unwrap_or(existing);
    for part in suffix.iter().rev() {
        real.push(part);
    }
    real
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (tempfile::TempDir, PathResolver) {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path().join("tool_outputs"));
        (dir, resolver)
    }

    #[test]
    fn sanitize_strips_trailing_delimiter_clusters() {
        assert_eq!(sanitize_raw_path("/p/File.java}},"), "/p/File.java");
        assert_eq!(sanitize_raw_path("/p/a.rs}}"), "/p/a.rs");
        // Single trailing brace is a legitimate POSIX name.
        assert_eq!(sanitize_raw_path("/p/data}"), "/p/data}");
    }

    #[test]
    fn sanitize_strips_quote_delimiter_tails() {
        assert_eq!(sanitize_raw_path("/p/a.rs'}"), "/p/a.rs");
        assert_eq!(sanitize_raw_path("/p/a.rs\"}"), "/p/a.rs");
        assert_eq!(sanitize_raw_path("`/p/a.rs`"), "/p/a.rs");
        assert_eq!(sanitize_raw_path("\"/p/a.rs\""), "/p/a.rs");
    }

    #[test]
    fn sanitize_is_stable_for_clean_paths() {
        assert_eq!(sanitize_raw_path("/p/src/main.rs"), "/p/src/main.rs");
        assert_eq!(sanitize_raw_path("  /p/x.txt  "), "/p/x.txt");
    }

    #[test]
    fn suffix_noise_resolves_to_same_path() {
        let (dir, resolver) = resolver();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let clean = root.join("main.rs");
        std::fs::write(&clean, "fn main() {}").unwrap();

        let base = resolver
            .resolve(clean.to_str().unwrap(), Some(&root), false)
            .unwrap();
        for suffix in ["}}", "'}", "\"}"] {
            let noisy = format!("{}{}", clean.display(), suffix);
            let resolved = resolver.resolve(&noisy, Some(&root), false).unwrap();
            assert_eq!(resolved, base);
        }
    }

    #[test]
    fn relative_paths_are_rejected() {
        let (_dir, resolver) = resolver();
        let err = resolver.resolve("src/main.rs", None, true).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn blocked_prefixes_are_rejected() {
        let (_dir, resolver) = resolver();
        for path in ["/etc/passwd", "/proc/self/mem", "/usr/bin/env"] {
            let err = resolver.resolve(path, None, true).unwrap_err();
            assert!(err.to_string().contains("restricted"), "{} not blocked", path);
        }
    }

    #[test]
    fn outside_project_root_is_rejected_without_external() {
        let (dir, resolver) = resolver();
        let root = dir.path().join("project");
        let other = dir.path().join("elsewhere");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        let outside = other.join("secret.txt");
        std::fs::write(&outside, "x").unwrap();

        let err = resolver
            .resolve(outside.to_str().unwrap(), Some(&root), false)
            .unwrap_err();
        assert!(err.to_string().contains("outside the project root"));

        // allow_external opts in.
        assert!(resolver
            .resolve(outside.to_str().unwrap(), Some(&root), true)
            .is_ok());
    }

    #[test]
    fn tool_outputs_paths_bypass_root_restriction() {
        let (dir, resolver) = resolver();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let spill = resolver.tool_outputs_root().join("projects/p1/out.txt");
        std::fs::create_dir_all(spill.parent().unwrap()).unwrap();
        std::fs::write(&spill, "big").unwrap();

        assert!(resolver
            .resolve(spill.to_str().unwrap(), Some(&root), false)
            .is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let (dir, resolver) = resolver();
        let root = dir.path().join("project");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("real.txt"), "x").unwrap();
        let link = root.join("sneaky.txt");
        std::os::unix::fs::symlink(outside.join("real.txt"), &link).unwrap();

        let err = resolver
            .resolve(link.to_str().unwrap(), Some(&root), false)
            .unwrap_err();
        assert!(err.to_string().contains("outside the project root"));
    }
}
