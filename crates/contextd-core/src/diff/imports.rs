//! Dependency extraction from added diff lines

use once_cell::sync::Lazy;
use regex::Regex;

/// How a captured module path maps to a dependency name
#[derive(Clone, Copy)]
enum Normalize {
    /// npm-style: `pkg/sub` → `pkg`, `@scope/pkg/sub` → `@scope/pkg`
    Package,
    /// dotted: `os.path` → `os`
    Dotted,
    /// taken as is
    Verbatim,
}

const IMPORT_TABLE: &[(&str, usize, Normalize)] = &[
    (r#"^\s*import\s+(?:[^'"]*\s+from\s+)?['"]([^'"]+)['"]"#, 1, Normalize::Package),
    (r#"^\s*export\s+[^'"]*\s+from\s+['"]([^'"]+)['"]"#, 1, Normalize::Package),
    (r#"require\(\s*['"]([^'"]+)['"]\s*\)"#, 1, Normalize::Package),
    (r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b", 1, Normalize::Dotted),
    (r"^\s*import\s+([A-Za-z_][\w.]*)\s*$", 1, Normalize::Dotted),
    (r"^\s*(?:pub\s+)?use\s+([A-Za-z_]\w*)::", 1, Normalize::Verbatim),
    (r"^\s*extern\s+crate\s+([A-Za-z_]\w*)", 1, Normalize::Verbatim),
];

/// Rust path roots that refer to the current crate
const LOCAL_ROOTS: &[&str] = &["crate", "self", "super"];

static IMPORTS: Lazy<Vec<(Regex, usize, Normalize)>> = Lazy::new(|| {
    IMPORT_TABLE
        .iter()
        .filter_map(|(p, g, n)| Regex::new(p).ok().map(|re| (re, *g, *n)))
        .collect()
});

fn normalize(raw: &str, mode: Normalize) -> Option<String> {
    if raw.starts_with('.') || raw.starts_with('/') {
        return None;
    }
    let name = match mode {
        Normalize::Package => {
            let mut parts = raw.split('/');
            let first = parts.next()?;
            if first.starts_with('@') {
                format!("{}/{}", first, parts.next()?)
            } else {
                first.to_string()
            }
        }
        Normalize::Dotted => raw.split('.').next()?.to_string(),
        Normalize::Verbatim => raw.to_string(),
    };
    if name.is_empty() || LOCAL_ROOTS.contains(&name.as_str()) {
        None
    } else {
        Some(name)
    }
}

/// Extract external dependency names imported by `lines`, deduplicated in first-seen order.
/// Relative imports and crate-local paths are skipped.
pub fn scan_imports<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for line in lines {
        for (re, group, mode) in IMPORTS.iter() {
            let Some(raw) = re.captures(line).and_then(|c| c.get(*group)) else {
                continue;
            };
            if let Some(name) = normalize(raw.as_str(), *mode) {
                if !found.contains(&name) {
                    found.push(name);
                }
            }
            break;
        }
    }
    found
}
