//! Unified diff parser
//!
//! Turns `git diff` output (one or more files concatenated) into [`ParsedDiff`] records.

use crate::types::{ChangeType, DiffHunk, DiffLine, LineKind, ParsedDiff};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write;

static FILE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^diff --git a/(\S+) b/(\S+)").expect("valid file header regex"));

static HUNK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

const FILE_MARKER: &str = "diff --git ";

/// Parse one or more concatenated unified diffs.
///
/// Chunks whose `diff --git` header has no recognizable `a/… b/…` pair are dropped.
pub fn parse_diff(text: &str) -> Vec<ParsedDiff> {
    split_files(text)
        .into_iter()
        .filter_map(parse_file)
        .collect()
}

/// Split on `diff --git` header lines. Text before the first header is ignored.
fn split_files(text: &str) -> Vec<Vec<&str>> {
    let mut files: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        if line.starts_with(FILE_MARKER) {
            files.push(vec![line]);
        } else if let Some(current) = files.last_mut() {
            current.push(line);
        }
    }
    files
}

fn parse_file(lines: Vec<&str>) -> Option<ParsedDiff> {
    let header = FILE_HEADER.captures(lines.first()?)?;
    let file_path = header.get(2)?.as_str().to_string();

    // Extended header lines (mode, rename, index, ---/+++) sit before the first hunk
    let first_hunk = lines
        .iter()
        .position(|l| l.starts_with("@@"))
        .unwrap_or(lines.len());
    let change_type = classify(&lines[..first_hunk]);

    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut new_line = 0u32;

    for line in &lines[first_hunk..] {
        if let Some(caps) = HUNK_HEADER.captures(line) {
            let num = |i: usize, default: u32| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(default)
            };
            let hunk = DiffHunk {
                old_start: num(1, 0),
                old_count: num(2, 1),
                new_start: num(3, 0),
                new_count: num(4, 1),
                lines: Vec::new(),
            };
            new_line = hunk.new_start;
            hunks.push(hunk);
            continue;
        }

        let Some(hunk) = hunks.last_mut() else {
            continue;
        };

        if line.starts_with('+') && !line.starts_with("++") {
            hunk.lines.push(DiffLine {
                kind: LineKind::Add,
                content: line[1..].to_string(),
                line_number: new_line,
            });
            new_line += 1;
        } else if line.starts_with('-') && !line.starts_with("--") {
            hunk.lines.push(DiffLine {
                kind: LineKind::Remove,
                content: line[1..].to_string(),
                line_number: new_line,
            });
        } else if let Some(content) = line.strip_prefix(' ') {
            hunk.lines.push(DiffLine {
                kind: LineKind::Context,
                content: content.to_string(),
                line_number: new_line,
            });
            new_line += 1;
        }
        // "\ No newline at end of file" and anything else: not part of either side
    }

    let lines_added = hunks.iter().map(DiffHunk::added).sum();
    let lines_removed = hunks.iter().map(DiffHunk::removed).sum();

    Some(ParsedDiff {
        file_path,
        change_type,
        hunks,
        lines_added,
        lines_removed,
    })
}

fn classify(header_lines: &[&str]) -> ChangeType {
    let has = |needle: &str| header_lines.iter().any(|l| l.contains(needle));
    if has("new file mode") {
        ChangeType::Added
    } else if has("deleted file mode") {
        ChangeType::Deleted
    } else if has("rename from") {
        ChangeType::Renamed
    } else {
        ChangeType::Modified
    }
}

/// Serialize parsed diffs back to unified diff text.
///
/// Re-parsing the output reproduces the same hunk headers and line classifications.
pub fn render_diff(diffs: &[ParsedDiff]) -> String {
    let mut out = String::new();
    for diff in diffs {
        let path = &diff.file_path;
        let _ = writeln!(out, "diff --git a/{path} b/{path}");
        match diff.change_type {
            ChangeType::Added => {
                let _ = writeln!(out, "new file mode 100644\n--- /dev/null\n+++ b/{path}");
            }
            ChangeType::Deleted => {
                let _ = writeln!(out, "deleted file mode 100644\n--- a/{path}\n+++ /dev/null");
            }
            ChangeType::Renamed => {
                let _ = writeln!(
                    out,
                    "rename from {path}\nrename to {path}\n--- a/{path}\n+++ b/{path}"
                );
            }
            ChangeType::Modified => {
                let _ = writeln!(out, "--- a/{path}\n+++ b/{path}");
            }
        }
        for hunk in &diff.hunks {
            let _ = writeln!(
                out,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
            );
            for line in &hunk.lines {
                let prefix = match line.kind {
                    LineKind::Add => '+',
                    LineKind::Remove => '-',
                    LineKind::Context => ' ',
                };
                let _ = writeln!(out, "{}{}", prefix, line.content);
            }
        }
    }
    out
}
