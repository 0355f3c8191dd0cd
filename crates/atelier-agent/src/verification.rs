//! Post-agent verification: run static checkers over files edited this
//! turn and format findings for a follow-up turn.
//!
//! Checkers by language: ruff (Python lint), tsc (TypeScript/JavaScript
//! types), cargo check (Rust compile). All run as subprocesses with a
//! timeout; a missing checker binary is treated as "no findings" rather
//! than an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

const CHECKER_TIMEOUT: Duration = Duration::from_secs(60);
const VERIFICATION_PREFIX: &str = "The following lint/type issues were found";

/// A single issue from a checker.
#[derive(Debug, Clone)]
pub struct VerificationIssue {
    pub file: String,
    pub line: u64,
    pub column: Option<u64>,
    pub code: Option<String>,
    pub message: String,
    pub tool: String,
}

/// Whether a user message is itself a verification follow-up, so the
/// verifier never chases its own tail.
pub fn is_verification_message(content: &str) -> bool {
    content.starts_with(VERIFICATION_PREFIX)
}

/// Format issues as the synthetic user message for the follow-up turn.
pub fn format_message_for_agent(issues: &[VerificationIssue]) -> String {
    let mut lines = vec![
        format!(
            "{} in files you edited. Please verify they are real problems and fix them:",
            VERIFICATION_PREFIX
        ),
        String::new(),
    ];
    for issue in issues {
        let mut loc = format!("{}:{}", issue.file, issue.line);
        if let Some(column) = issue.column {
            loc = format!("{}:{}", loc, column);
        }
        let line = match &issue.code {
            Some(code) => format!("[{}] {}: {} {}", issue.tool, loc, code, issue.message),
            None => format!("[{}] {}: {}", issue.tool, loc, issue.message),
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// Human-readable summary and per-tool counts.
pub fn format_summary(issues: &[VerificationIssue]) -> (String, BTreeMap<String, usize>) {
    let mut by_tool: BTreeMap<String, usize> = BTreeMap::new();
    for issue in issues {
        *by_tool.entry(issue.tool.clone()).or_default() += 1;
    }
    let unique_files: std::collections::BTreeSet<&str> =
        issues.iter().map(|i| i.file.as_str()).collect();
    let mut parts = vec![
        format!("{} issue{}", issues.len(), if issues.len() == 1 { "" } else { "s" }),
        format!(
            "in {} file{}",
            unique_files.len(),
            if unique_files.len() == 1 { "" } else { "s" }
        ),
    ];
    if !by_tool.is_empty() {
        let tool_parts: Vec<String> = by_tool.iter().map(|(t, c)| format!("{} {}", c, t)).collect();
        parts.push(format!("({})", tool_parts.join(", ")));
    }
    (parts.join(" "), by_tool)
}

async fn run_cmd(program: &str, args: &[&str], cwd: &Path) -> Option<(String, String, i32)> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            log::debug!("checker {} unavailable: {}", program, err);
            return None;
        }
    };
    match tokio::time::timeout(CHECKER_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => Some((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(-1),
        )),
        Ok(Err(err)) => {
            log::warn!("checker {} failed: {}", program, err);
            None
        }
        Err(_) => {
            log::warn!("checker {} timed out", program);
            None
        }
    }
}

async fn run_ruff(paths: &[PathBuf], project_root: &Path) -> Vec<VerificationIssue> {
    let mut issues = Vec::new();
    for path in paths {
        if !path.exists() {
            continue;
        }
        let path_str = path.display().to_string();
        let Some((stdout, _, _)) = run_cmd(
            "ruff",
            &["check", &path_str, "--output-format=json"],
            project_root,
        )
        .await
        else {
            continue;
        };
        let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&stdout) else {
            continue;
        };
        for entry in entries {
            let location = entry.get("location").cloned().unwrap_or(Value::Null);
            issues.push(VerificationIssue {
                file: entry
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or(&path_str)
                    .to_string(),
                line: location.get("row").and_then(Value::as_u64).unwrap_or(0),
                column: location.get("column").and_then(Value::as_u64),
                code: entry.get("code").and_then(Value::as_str).map(str::to_string),
                message: entry
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tool: "ruff".to_string(),
            });
        }
    }
    issues
}

/// Parse `path(line,col): error TSNNNN: message` lines from tsc.
fn parse_tsc_line(line: &str) -> Option<VerificationIssue> {
    let (loc, rest) = line.split_once("): ")?;
    let (path, pos) = loc.split_once('(')?;
    let (row, col) = pos.split_once(',')?;
    let rest = rest.trim();
    let (code, message) = match rest.strip_prefix("error ") {
        Some(tail) => match tail.split_once(": ") {
            Some((code, message)) => (Some(code.to_string()), message.to_string()),
            None => (None, tail.to_string()),
        },
        None => (None, rest.to_string()),
    };
    Some(VerificationIssue {
        file: path.trim().to_string(),
        line: row.trim().parse().ok()?,
        column: col.trim().parse().ok(),
        code,
        message,
        tool: "tsc".to_string(),
    })
}

async fn run_tsc(paths: &[PathBuf], project_root: &Path) -> Vec<VerificationIssue> {
    if paths.is_empty() {
        return Vec::new();
    }
    let Some((stdout, stderr, code)) =
        run_cmd("tsc", &["--noEmit", "--pretty", "false"], project_root).await
    else {
        return Vec::new();
    };
    if code == 0 {
        return Vec::new();
    }
    let edited: std::collections::BTreeSet<String> =
        paths.iter().map(|p| p.display().to_string()).collect();
    format!("{}\n{}", stdout, stderr)
        .lines()
        .filter_map(parse_tsc_line)
        .filter(|issue| {
            edited
                .iter()
                .any(|edited_path| edited_path.ends_with(&issue.file) || issue.file.ends_with(edited_path.trim_start_matches('/')))
        })
        .collect()
}

async fn run_cargo_check(paths: &[PathBuf], project_root: &Path) -> Vec<VerificationIssue> {
    if paths.is_empty() || !project_root.join("Cargo.toml").exists() {
        return Vec::new();
    }
    let Some((stdout, _, _)) = run_cmd(
        "cargo",
        &["check", "--message-format=json", "--quiet"],
        project_root,
    )
    .await
    else {
        return Vec::new();
    };

    let edited: std::collections::BTreeSet<String> =
        paths.iter().map(|p| p.display().to_string()).collect();
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("reason").and_then(Value::as_str) != Some("compiler-message") {
            continue;
        }
        let Some(message) = entry.get("message") else { continue };
        let level = message.get("level").and_then(Value::as_str).unwrap_or("");
        if level != "error" {
            continue;
        }
        let Some(span) = message
            .get("spans")
            .and_then(Value::as_array)
            .and_then(|spans| spans.iter().find(|s| s.get("is_primary") == Some(&Value::Bool(true))))
        else {
            continue;
        };
        let file = span
            .get("file_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let matches_edit = edited.iter().any(|p| p.ends_with(&file));
        if !matches_edit {
            continue;
        }
        issues.push(VerificationIssue {
            line: span.get("line_start").and_then(Value::as_u64).unwrap_or(0),
            column: span.get("column_start").and_then(Value::as_u64),
            code: message
                .get("code")
                .and_then(|c| c.get("code"))
                .and_then(Value::as_str)
                .map(str::to_string),
            message: message
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            file,
            tool: "cargo".to_string(),
        });
    }
    issues
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| extensions.contains(&ext.to_string_lossy().as_ref()))
        .unwrap_or(false)
}

/// Run all applicable checkers over the edited paths.
pub async fn run_verification(
    edited_paths: &[PathBuf],
    project_root: &Path,
) -> (Vec<VerificationIssue>, String, BTreeMap<String, usize>) {
    let python: Vec<PathBuf> = edited_paths
        .iter()
        .filter(|p| has_extension(p, &["py"]))
        .cloned()
        .collect();
    let typescript: Vec<PathBuf> = edited_paths
        .iter()
        .filter(|p| has_extension(p, &["ts", "tsx", "js", "jsx"]))
        .cloned()
        .collect();
    let rust: Vec<PathBuf> = edited_paths
        .iter()
        .filter(|p| has_extension(p, &["rs"]))
        .cloned()
        .collect();

    let mut issues = Vec::new();
    issues.extend(run_ruff(&python, project_root).await);
    issues.extend(run_tsc(&typescript, project_root).await);
    issues.extend(run_cargo_check(&rust, project_root).await);

    let (summary, by_tool) = format_summary(&issues);
    (issues, summary, by_tool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(file: &str, tool: &str) -> VerificationIssue {
        VerificationIssue {
            file: file.to_string(),
            line: 3,
            column: Some(7),
            code: Some("E999".to_string()),
            message: "something broke".to_string(),
            tool: tool.to_string(),
        }
    }

    #[test]
    fn formatted_message_round_trips_the_prefix_check() {
        let message = format_message_for_agent(&[issue("src/a.py", "ruff")]);
        assert!(is_verification_message(&message));
        assert!(message.contains("[ruff] src/a.py:3:7: E999 something broke"));
        assert!(!is_verification_message("please fix the bug"));
    }

    #[test]
    fn summary_counts_tools_and_files() {
        let issues = vec![issue("a.py", "ruff"), issue("a.py", "ruff"), issue("b.ts", "tsc")];
        let (summary, by_tool) = format_summary(&issues);
        assert!(summary.contains("3 issues"));
        assert!(summary.contains("in 2 files"));
        assert_eq!(by_tool["ruff"], 2);
        assert_eq!(by_tool["tsc"], 1);
    }

    #[test]
    fn tsc_line_parsing() {
        let parsed = parse_tsc_line("src/app.ts(12,5): error TS2304: Cannot find name 'foo'.").unwrap();
        assert_eq!(parsed.file, "src/app.ts");
        assert_eq!(parsed.line, 12);
        assert_eq!(parsed.column, Some(5));
        assert_eq!(parsed.code.as_deref(), Some("TS2304"));
        assert!(parsed.message.contains("Cannot find name"));

        assert!(parse_tsc_line("not a tsc line").is_none());
    }

    #[tokio::test]
    async fn missing_checkers_yield_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        // No ruff/tsc/cargo project in an empty temp dir: clean result.
        let (issues, summary, _) = run_verification(
            &[dir.path().join("lonely.py")],
            dir.path(),
        )
        .await;
        assert!(issues.is_empty());
        assert!(summary.contains("0 issues"));
    }
}
