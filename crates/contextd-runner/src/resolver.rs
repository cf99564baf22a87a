//! Locating the Claude CLI binary

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable that pins the binary path
pub const AGENT_BIN_ENV: &str = "CONTEXTD_AGENT_BIN";

/// Bare name used when nothing else is found; resolved through PATH at spawn
pub const FALLBACK_BINARY: &str = "claude";

/// Common install locations, in lookup order
pub fn default_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".claude").join("local").join("claude"));
        candidates.push(home.join(".local").join("bin").join("claude"));
    }
    candidates.push(PathBuf::from("/usr/local/bin/claude"));
    candidates.push(PathBuf::from("/opt/homebrew/bin/claude"));
    candidates
}

/// Pick the binary to spawn.
///
/// A non-empty [`AGENT_BIN_ENV`] wins, then the first candidate for which `exists` holds,
/// then [`FALLBACK_BINARY`].
pub fn resolve_agent_binary(
    env: &HashMap<String, String>,
    candidates: &[PathBuf],
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    if let Some(pinned) = env.get(AGENT_BIN_ENV).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        return PathBuf::from(pinned);
    }
    candidates
        .iter()
        .find(|c| exists(c.as_path()))
        .cloned()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_BINARY))
}

/// Resolve against the live process environment and filesystem
pub fn resolve_from_environment() -> PathBuf {
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve_agent_binary(&env, &default_candidates(), |p| p.is_file())
}
