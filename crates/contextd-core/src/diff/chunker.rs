//! Function-level change chunking
//!
//! Attributes each hunk of a [`ParsedDiff`] to the enclosing function or class, using an
//! ordered table of boundary patterns. A hunk that crosses several boundaries is attributed
//! to the last one seen, so earlier functions in the same hunk are undercounted.

use crate::types::{FunctionChunk, ParsedDiff};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::trace;

/// Name used for hunks with no recognizable boundary
pub const MODULE_LEVEL: &str = "module-level";

/// Identifiers that look like calls/declarations to the patterns but are control flow
const CONTROL_FLOW: &[&str] = &["if", "for", "while", "switch", "catch", "else", "return"];

/// A boundary detection rule: lines matching `regex` open a scope named by `group`
struct BoundaryPattern {
    syntax: &'static str,
    regex: Regex,
    group: usize,
}

/// (syntax, pattern, capture group). Checked in order; first match wins per line.
const BOUNDARY_TABLE: &[(&str, &str, usize)] = &[
    (
        "js-function",
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
        1,
    ),
    (
        "class",
        r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
        1,
    ),
    (
        "js-arrow",
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)",
        1,
    ),
    ("python-def", r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)", 1),
    (
        "rust-fn",
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)",
        1,
    ),
    (
        "rust-impl",
        r"^\s*impl(?:<[^>]*>)?\s+(?:[\w:<>]+\s+for\s+)?([A-Za-z_]\w*)",
        1,
    ),
    (
        "rust-type",
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+([A-Za-z_]\w*)",
        1,
    ),
    ("go-func", r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)", 1),
    (
        "method",
        r"^\s*(?:(?:public|private|protected|static|async|override)\s+)*([A-Za-z_$][\w$]*)\s*\([^)]*\)\s*(?::\s*[^{]+)?\{\s*$",
        1,
    ),
];

static BOUNDARIES: Lazy<Vec<BoundaryPattern>> = Lazy::new(|| {
    BOUNDARY_TABLE
        .iter()
        .filter_map(|(syntax, pattern, group)| {
            Regex::new(pattern).ok().map(|regex| BoundaryPattern {
                syntax,
                regex,
                group: *group,
            })
        })
        .collect()
});

/// Return the scope name opened by `line`, if any
pub fn detect_boundary(line: &str) -> Option<&str> {
    match_boundary(line).map(|(_, name)| name)
}

/// Like [`detect_boundary`], also naming the rule that matched
fn match_boundary(line: &str) -> Option<(&'static str, &str)> {
    for pattern in BOUNDARIES.iter() {
        if let Some(caps) = pattern.regex.captures(line) {
            let name = caps.get(pattern.group)?.as_str();
            if CONTROL_FLOW.contains(&name) {
                return None;
            }
            return Some((pattern.syntax, name));
        }
    }
    None
}

/// Group the hunks of one file diff by enclosing function name.
///
/// Chunks are returned in order of first appearance.
pub fn chunk_by_function(diff: &ParsedDiff) -> Vec<FunctionChunk> {
    let mut chunks: Vec<FunctionChunk> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for hunk in &diff.hunks {
        let mut current: Option<(&str, u32)> = None;
        for line in &hunk.lines {
            if let Some((syntax, name)) = match_boundary(&line.content) {
                trace!(file = %diff.file_path, syntax, scope = name, line = line.line_number, "Scope boundary");
                current = Some((name, line.line_number));
            }
        }
        let (name, start_line) = current.unwrap_or((MODULE_LEVEL, hunk.new_start));

        let slot = match index.get(name) {
            Some(&i) => i,
            None => {
                chunks.push(FunctionChunk {
                    function_name: name.to_string(),
                    start_line,
                    hunks: Vec::new(),
                    lines_added: 0,
                    lines_removed: 0,
                });
                index.insert(name.to_string(), chunks.len() - 1);
                chunks.len() - 1
            }
        };

        let chunk = &mut chunks[slot];
        chunk.lines_added += hunk.added();
        chunk.lines_removed += hunk.removed();
        chunk.hunks.push(hunk.clone());
    }

    chunks
}
