//! File structure extraction: top-level declarations with line ranges.
//!
//! Languages with a compiled tree-sitter grammar get a real parse; the long
//! tail of mapped extensions falls back to a regex outline so structure mode
//! works across 50+ languages without erroring on exotic files.

use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Language, Node, Parser};

const TINY_FILE_THRESHOLD: usize = 500;

/// Extension (with dot) → language key.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        ".py" | ".pyi" => "python",
        ".js" | ".jsx" | ".mjs" | ".cjs" => "javascript",
        ".ts" | ".mts" | ".cts" => "typescript",
        ".tsx" => "tsx",
        ".go" => "go",
        ".rs" => "rust",
        ".java" => "java",
        ".rb" => "ruby",
        ".c" | ".h" => "c",
        ".cpp" | ".cc" | ".cxx" | ".hpp" => "cpp",
        ".cs" => "csharp",
        ".php" => "php",
        ".swift" => "swift",
        ".kt" | ".kts" => "kotlin",
        ".scala" | ".sc" => "scala",
        ".toml" => "toml",
        ".json" => "json",
        ".yaml" | ".yml" => "yaml",
        ".lua" => "lua",
        ".bash" | ".sh" | ".zsh" => "bash",
        ".dart" => "dart",
        ".zig" => "zig",
        ".r" | ".R" => "r",
        ".hs" | ".lhs" => "haskell",
        ".ex" | ".exs" => "elixir",
        ".heex" => "heex",
        ".erl" | ".hrl" => "erlang",
        ".nim" | ".nimble" => "nim",
        ".v" => "v",
        ".d" => "d",
        ".elm" => "elm",
        ".clj" | ".cljs" | ".cljc" => "clojure",
        ".fs" | ".fsi" | ".fsx" => "fsharp",
        ".ml" | ".mli" => "ocaml",
        ".sol" => "solidity",
        ".proto" => "proto",
        ".sql" => "sql",
        ".html" | ".htm" => "html",
        ".css" | ".less" => "css",
        ".scss" | ".sass" => "scss",
        ".vue" => "vue",
        ".svelte" => "svelte",
        ".astro" => "astro",
        ".graphql" | ".gql" => "graphql",
        ".prisma" => "prisma",
        ".hcl" | ".tf" | ".tfvars" => "hcl",
        ".nix" => "nix",
        ".rst" => "rst",
        ".md" => "markdown",
        ".make" | ".mk" => "make",
        ".cmake" => "cmake",
        ".dockerfile" => "dockerfile",
        ".rkt" => "racket",
        ".jl" => "julia",
        ".jsonnet" | ".libsonnet" => "jsonnet",
        ".groovy" | ".gy" => "groovy",
        ".gd" => "gdscript",
        ".ps1" | ".psm1" => "powershell",
        ".vim" => "vim",
        ".xml" => "xml",
        _ => return None,
    };
    Some(lang)
}

/// A named declaration with 1-based line range.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub kind: String,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
}

fn grammar_for(lang: &str) -> Option<Language> {
    let language: Language = match lang {
        "rust" => tree_sitter_rust::LANGUAGE.into(),
        "python" => tree_sitter_python::LANGUAGE.into(),
        // The TypeScript grammar handles plain JavaScript as well.
        "typescript" | "javascript" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        "tsx" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        "go" => tree_sitter_go::LANGUAGE.into(),
        "java" => tree_sitter_java::LANGUAGE.into(),
        "c" => tree_sitter_c::LANGUAGE.into(),
        "cpp" => tree_sitter_cpp::LANGUAGE.into(),
        "csharp" => tree_sitter_c_sharp::LANGUAGE.into(),
        "ruby" => tree_sitter_ruby::LANGUAGE.into(),
        _ => return None,
    };
    Some(language)
}

fn decl_kinds(lang: &str) -> &'static [&'static str] {
    match lang {
        "rust" => &["struct_item", "enum_item", "trait_item", "impl_item", "function_item"],
        "python" => &["class_definition", "function_definition"],
        "typescript" | "javascript" | "tsx" => &[
            "class_declaration",
            "function_declaration",
            "interface_declaration",
            "enum_declaration",
        ],
        "go" => &["type_declaration", "function_declaration", "method_declaration"],
        "java" => &["class_declaration", "interface_declaration", "method_declaration"],
        "c" => &["struct_specifier", "function_definition"],
        "cpp" => &["class_specifier", "struct_specifier", "function_definition"],
        "csharp" => &["class_declaration", "struct_declaration", "method_declaration"],
        "ruby" => &["class", "module", "method"],
        _ => &[],
    }
}

const NAME_NODE_KINDS: &[&str] = &[
    "identifier",
    "name",
    "type_identifier",
    "property_identifier",
    "field_identifier",
    "constant",
];

fn node_name(node: Node<'_>, source: &[u8]) -> Option<String> {
    if let Some(named) = node.child_by_field_name("name") {
        if let Ok(text) = named.utf8_text(source) {
            return Some(text.to_string());
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if NAME_NODE_KINDS.contains(&child.kind()) {
            if let Ok(text) = child.utf8_text(source) {
                return Some(text.to_string());
            }
        }
    }
    // One more level covers wrappers like rust's impl type path.
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let mut inner = child.walk();
        for grandchild in child.children(&mut inner) {
            if NAME_NODE_KINDS.contains(&grandchild.kind()) {
                if let Ok(text) = grandchild.utf8_text(source) {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

fn walk_declarations(
    node: Node<'_>,
    source: &[u8],
    kinds: &[&str],
    depth: usize,
    decls: &mut Vec<Declaration>,
) {
    if depth > 1 {
        return;
    }
    if kinds.contains(&node.kind()) {
        let name = node_name(node, source).unwrap_or_else(|| format!("<{}>", node.kind()));
        decls.push(Declaration {
            kind: node.kind().to_string(),
            name,
            start_line: node.start_position().row + 1,
            end_line: node.end_position().row + 1,
        });
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_declarations(child, source, kinds, depth + 1, decls);
    }
}

fn tree_sitter_outline(content: &str, lang: &str) -> Option<Vec<Declaration>> {
    if lang == "elixir" {
        return elixir_outline(content);
    }
    let language = grammar_for(lang)?;
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    let mut decls = Vec::new();
    walk_declarations(tree.root_node(), content.as_bytes(), decl_kinds(lang), 0, &mut decls);
    Some(decls)
}

const ELIXIR_DEF_KEYWORDS: &[&str] = &[
    "defmodule",
    "def",
    "defp",
    "defmacro",
    "defmacrop",
    "defprotocol",
    "defimpl",
];

/// The elixir grammar is call-based: `defmodule`/`def` are plain `call`
/// nodes, so declarations are recognized by their target keyword and named
/// by their first argument (an alias for modules, a bare identifier or an
/// inner call head for functions).
fn elixir_call_declaration(node: Node<'_>, source: &[u8]) -> Option<Declaration> {
    if node.kind() != "call" {
        return None;
    }
    let target = node.child_by_field_name("target")?;
    let keyword = target.utf8_text(source).ok()?;
    if !ELIXIR_DEF_KEYWORDS.contains(&keyword) {
        return None;
    }

    let mut cursor = node.walk();
    let name = node
        .children(&mut cursor)
        .find(|child| child.kind() == "arguments")
        .and_then(|arguments| arguments.named_child(0))
        .map(|argument| match argument.kind() {
            // `defp helper(x)` wraps the name in an inner call head.
            "call" => argument
                .child_by_field_name("target")
                .and_then(|head| head.utf8_text(source).ok())
                .unwrap_or(keyword)
                .to_string(),
            _ => argument
                .utf8_text(source)
                .map(str::to_string)
                .unwrap_or_else(|_| format!("<{}>", keyword)),
        })
        .unwrap_or_else(|| format!("<{}>", keyword));

    Some(Declaration {
        kind: keyword.to_string(),
        name,
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
    })
}

fn elixir_outline(content: &str) -> Option<Vec<Declaration>> {
    let language: Language = tree_sitter_elixir::LANGUAGE.into();
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    let source = content.as_bytes();

    let mut decls = Vec::new();
    let root = tree.root_node();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let Some(decl) = elixir_call_declaration(child, source) else {
            continue;
        };
        let is_module = decl.kind == "defmodule";
        decls.push(decl);
        if !is_module {
            continue;
        }
        // Defs one level inside the module body, mirroring the depth cap
        // the generic walker applies to other languages.
        let mut parts = child.walk();
        for part in child.children(&mut parts) {
            if part.kind() != "do_block" {
                continue;
            }
            let mut body = part.walk();
            for statement in part.children(&mut body) {
                if let Some(inner) = elixir_call_declaration(statement, source) {
                    decls.push(inner);
                }
            }
        }
    }
    Some(decls)
}

static FN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:pub(?:\(crate\))?\s+)?(?:async\s+)?(?:def|fn|func|function|fun|proc|sub)\s+([A-Za-z_][A-Za-z0-9_!?]*)",
    )
    .unwrap()
});

static TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:pub(?:\(crate\))?\s+)?(class|interface|trait|struct|enum|module|object|type|contract|message|service|model|defmodule)\s+([A-Za-z_][A-Za-z0-9_.]*)",
    )
    .unwrap()
});

static HEADING_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").unwrap());

/// Line-based outline for languages without a compiled grammar.
fn regex_outline(content: &str, lang: &str) -> Vec<Declaration> {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let mut decls: Vec<Declaration> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let entry = if lang == "markdown" || lang == "rst" {
            HEADING_PATTERN
                .captures(line)
                .map(|c| ("heading".to_string(), c.get(2).unwrap().as_str().trim().to_string()))
        } else if let Some(caps) = FN_PATTERN.captures(line) {
            Some(("function".to_string(), caps.get(1).unwrap().as_str().to_string()))
        } else {
            TYPE_PATTERN.captures(line).map(|caps| {
                (
                    caps.get(1).unwrap().as_str().to_string(),
                    caps.get(2).unwrap().as_str().to_string(),
                )
            })
        };
        if let Some((kind, name)) = entry {
            decls.push(Declaration {
                kind,
                name,
                start_line: idx + 1,
                end_line: idx + 1,
            });
        }
    }

    // Extend each declaration to the line before the next one.
    for i in 0..decls.len() {
        decls[i].end_line = if i + 1 < decls.len() {
            decls[i + 1].start_line.saturating_sub(1).max(decls[i].start_line)
        } else {
            total.max(decls[i].start_line)
        };
    }
    decls
}

/// Format a declaration outline, mirroring the span-read hint the agent is
/// expected to follow up with.
pub fn get_file_structure(content: &str, path: &str) -> String {
    let total = content.lines().count();
    if content.len() < TINY_FILE_THRESHOLD {
        return format!(
            "File: {} ({} lines)\nFile too small for structure. Call read_file with start and end \
             (e.g. start=1, end={}) to read the file.\n",
            path, total, total
        );
    }

    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default();
    let Some(lang) = language_for_extension(&ext) else {
        return format!(
            "File: {} ({} lines)\nUnsupported extension for structure. Call read_file with start \
             and end to read specific sections.\n",
            path, total
        );
    };

    let decls = tree_sitter_outline(content, lang).unwrap_or_else(|| regex_outline(content, lang));
    if decls.is_empty() {
        return format!(
            "File: {} ({} lines)\nNo top-level declarations found. Call read_file with start and \
             end (e.g. start=1, end={}) to read the file.\n",
            path, total, total
        );
    }

    let mut parts = vec![format!("File: {} ({} lines)", path, total)];
    for d in &decls {
        parts.push(format!("  {} {} (lines {}-{})", d.kind, d.name, d.start_line, d.end_line));
    }
    parts.push("\nTo read specific content, call read_file with start and end (1-based line numbers).".to_string());
    parts.join("\n")
}
