//! Version control access
//!
//! The orchestrator only sees [`VersionControl`]; [`GitCli`] shells out to `git`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// `git status --porcelain` output
    async fn status(&self) -> Result<String>;

    /// Current branch name, `None` on a detached head
    async fn current_branch(&self) -> Result<Option<String>>;

    /// One-line log entries, newest first
    async fn log(&self, limit: usize) -> Result<Vec<String>>;

    async fn diff_stat(&self) -> Result<String>;

    /// Working tree diff against HEAD, optionally limited to one path
    async fn diff(&self, path: Option<&str>) -> Result<String>;

    /// Paths with uncommitted changes
    async fn changed_files(&self) -> Result<Vec<String>>;

    async fn blame(&self, path: &str) -> Result<String>;

    async fn diff_range(&self, from: &str, to: &str) -> Result<String>;
}

/// `git` subprocess wrapper rooted at the project directory
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = timeout(
            GIT_TIMEOUT,
            Command::new("git")
                .arg("-C")
                .arg(&self.root)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("git {} timed out", args.join(" ")))?
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Path column of a `status --porcelain` line; renames report the new path
fn porcelain_path(line: &str) -> Option<String> {
    let path = line.get(3..)?.trim();
    let path = path.rsplit_once(" -> ").map(|(_, to)| to).unwrap_or(path);
    let path = path.trim_matches('"');
    (!path.is_empty()).then(|| path.to_string())
}

#[async_trait]
impl VersionControl for GitCli {
    async fn status(&self) -> Result<String> {
        self.run(&["status", "--porcelain"]).await
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let branch = branch.trim();
        Ok((!branch.is_empty() && branch != "HEAD").then(|| branch.to_string()))
    }

    async fn log(&self, limit: usize) -> Result<Vec<String>> {
        let n = format!("-{}", limit.max(1));
        Ok(non_empty_lines(&self.run(&["log", "--oneline", &n]).await?))
    }

    async fn diff_stat(&self) -> Result<String> {
        self.run(&["diff", "HEAD", "--stat"]).await
    }

    async fn diff(&self, path: Option<&str>) -> Result<String> {
        match path {
            Some(path) => self.run(&["diff", "HEAD", "--", path]).await,
            None => self.run(&["diff", "HEAD"]).await,
        }
    }

    async fn changed_files(&self) -> Result<Vec<String>> {
        let status = self.status().await?;
        Ok(status.lines().filter_map(porcelain_path).collect())
    }

    async fn blame(&self, path: &str) -> Result<String> {
        self.run(&["blame", "--line-porcelain", "--", path]).await
    }

    async fn diff_range(&self, from: &str, to: &str) -> Result<String> {
        let range = format!("{}..{}", from, to);
        self.run(&["diff", &range]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextd_core::diff::parse_diff;

    #[test]
    fn test_porcelain_path() {
        assert_eq!(porcelain_path(" M src/a.rs").as_deref(), Some("src/a.rs"));
        assert_eq!(porcelain_path("?? new.txt").as_deref(), Some("new.txt"));
        assert_eq!(porcelain_path("R  old.rs -> new.rs").as_deref(), Some("new.rs"));
        assert_eq!(porcelain_path("M").as_deref(), None);
    }

    async fn git(dir: &std::path::Path, args: &[&str]) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_git_cli_against_scratch_repo() {
        let dir = tempfile::tempdir().unwrap();
        // skip quietly where git is unavailable
        if !git(dir.path(), &["init", "-q", "-b", "main"]).await {
            return;
        }
        git(dir.path(), &["config", "user.email", "dev@example.com"]).await;
        git(dir.path(), &["config", "user.name", "Dev"]).await;
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\n").unwrap();
        git(dir.path(), &["add", "."]).await;
        assert!(git(dir.path(), &["commit", "-q", "-m", "first"]).await);

        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\nfn b() {}\n").unwrap();

        let vcs = GitCli::new(dir.path());
        assert_eq!(vcs.current_branch().await.unwrap().as_deref(), Some("main"));
        assert_eq!(vcs.log(5).await.unwrap().len(), 1);
        assert_eq!(vcs.changed_files().await.unwrap(), vec!["lib.rs".to_string()]);

        let diffs = parse_diff(&vcs.diff(Some("lib.rs")).await.unwrap());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].lines_added, 1);
        assert!(vcs.diff_stat().await.unwrap().contains("lib.rs"));
        assert!(vcs.blame("lib.rs").await.unwrap().contains("author Dev"));
        assert!(vcs.diff_range("HEAD", "HEAD").await.unwrap().is_empty());
        assert!(vcs.blame("missing.rs").await.is_err());
    }
}
