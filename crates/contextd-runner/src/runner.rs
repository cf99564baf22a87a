//! Claude CLI invocation
//!
//! Spawns `claude -p <prompt>` non-interactively and captures its output.

use crate::resolver::resolve_from_environment;
use crate::types::*;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Something that can run an [`AgentRequest`] to completion
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> AgentOutcome;
}

/// Claude Code CLI runner
pub struct ClaudeRunner {
    binary: PathBuf,
    default_timeout: Duration,
    default_model: Option<String>,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeRunner {
    /// Runner for the binary found by [`resolve_from_environment`]
    pub fn new() -> Self {
        Self::with_binary(resolve_from_environment())
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            default_timeout: DEFAULT_TIMEOUT,
            default_model: None,
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(model) = request.model.as_ref().or(self.default_model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        match &request.output_schema {
            Some(schema) => {
                args.push("--output-format".to_string());
                args.push("json".to_string());
                args.push("--json-schema".to_string());
                args.push(schema.to_string());
            }
            None => {
                args.push("--output-format".to_string());
                args.push("text".to_string());
            }
        }
        args
    }

    /// Run the CLI and return stdout. Non-zero exit, spawn failure and timeout are errors.
    pub async fn execute(&self, request: &AgentRequest) -> Result<String, RunnerError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let args = self.build_args(request);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            // a nested CLI refuses to start if it thinks it's inside another session
            .env_remove("CLAUDECODE")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &request.cwd {
            cmd.current_dir(dir);
        }
        // own group, so a timeout can take down whatever the CLI spawned too
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            agent = %request.agent_name,
            binary = %self.binary.display(),
            ?timeout,
            "Starting Claude CLI"
        );

        let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        let pid = child.id();
        // dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                warn!(agent = %request.agent_name, ?timeout, pid, "Claude CLI timed out, killed");
                return Err(RunnerError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let status = match output.status.code() {
            Some(code) => format!("code {}", code),
            None => "signal".to_string(),
        };
        Err(RunnerError::Exit {
            status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            stdout,
        })
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    // negative pid addresses the whole group
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "Process group already gone");
    }
}

#[async_trait]
impl AgentInvoker for ClaudeRunner {
    async fn invoke(&self, request: &AgentRequest) -> AgentOutcome {
        match self.execute(request).await {
            Ok(output) => AgentOutcome::ok(output),
            Err(e) => {
                debug!(agent = %request.agent_name, error = %e, "Claude CLI run failed");
                e.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_args() {
        let runner = ClaudeRunner::with_binary("claude");
        let args = runner.build_args(&AgentRequest::new("summary", "hello"));
        assert_eq!(
            args,
            vec!["-p", "hello", "--dangerously-skip-permissions", "--output-format", "text"]
        );
    }

    #[test]
    fn test_schema_and_model_args() {
        let runner = ClaudeRunner::with_binary("claude").default_model(Some("haiku".into()));
        let schema = serde_json::json!({"type": "object"});
        let args = runner.build_args(&AgentRequest::new("extract", "go").schema(schema));
        assert_eq!(
            args,
            vec![
                "-p",
                "go",
                "--dangerously-skip-permissions",
                "--model",
                "haiku",
                "--output-format",
                "json",
                "--json-schema",
                r#"{"type":"object"}"#,
            ]
        );

        let args = runner.build_args(&AgentRequest::new("extract", "go").model("opus"));
        assert_eq!(args[3..5], ["--model".to_string(), "opus".to_string()]);
    }

    // Every spawning case lives in one test so no other test thread forks while a script
    // is open for writing.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_outcomes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let echo = script("echo.sh", r#"echo "$@"; echo "cc=${CLAUDECODE:-unset}""#);
        let fail = script("fail.sh", "echo partial; echo boom >&2; exit 3");
        let slow = script("slow.sh", "sleep 5");
        let pwd = script("pwd.sh", "pwd");
        let pid_file = dir.path().join("grandchild.pid");
        let spawner = script(
            "spawner.sh",
            &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
        );

        let outcome = ClaudeRunner::with_binary(dir.path().join("no-such-claude"))
            .invoke(&AgentRequest::new("t", "hi"))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Failed to spawn"));

        let outcome = ClaudeRunner::with_binary(&echo)
            .invoke(&AgentRequest::new("t", "hello world"))
            .await;
        assert!(outcome.success);
        assert!(outcome
            .output
            .contains("-p hello world --dangerously-skip-permissions --output-format text"));
        assert!(outcome.output.contains("cc=unset"));
        assert!(outcome.error.is_none());

        let outcome = ClaudeRunner::with_binary(&fail)
            .invoke(&AgentRequest::new("t", "x"))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.output.trim(), "partial");
        let error = outcome.error.unwrap();
        assert!(error.contains("code 3"));
        assert!(error.contains("boom"));

        let started = std::time::Instant::now();
        let outcome = ClaudeRunner::with_binary(&slow)
            .invoke(&AgentRequest::new("t", "x").timeout(Duration::from_millis(200)))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));

        let outcome = ClaudeRunner::with_binary(&spawner)
            .invoke(&AgentRequest::new("t", "x").timeout(Duration::from_millis(300)))
            .await;
        assert!(outcome.error.unwrap().contains("Timed out"));
        let grandchild: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let gone = |pid: i32| {
            let alive = unsafe { libc::kill(pid, 0) } == 0;
            // an unreaped zombie still answers signal 0
            let zombie = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .map(|stat| stat.contains(") Z "))
                .unwrap_or(false);
            !alive || zombie
        };
        let mut reaped = false;
        for _ in 0..40 {
            if gone(grandchild) {
                reaped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(reaped, "grandchild {} outlived the timeout", grandchild);

        let outcome = ClaudeRunner::with_binary(&pwd)
            .invoke(&AgentRequest::new("t", "x").cwd(dir.path()))
            .await;
        assert!(outcome.success);
        let reported = std::fs::canonicalize(outcome.output.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }
}
