//! Request/outcome types for external analysis runs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock limit for one invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

/// One invocation of the external analysis tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Label recorded in the run ledger
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub prompt: String,
    /// Working directory for the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Overrides the runner's default timeout
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// JSON schema for structured output; `None` asks for plain text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentRequest {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Result of an invocation. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub success: bool,
    /// Captured stdout, possibly partial on failure
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
        }
    }
}

impl From<RunnerError> for AgentOutcome {
    fn from(err: RunnerError) -> Self {
        let message = err.to_string();
        match err {
            RunnerError::Exit { stdout, .. } => AgentOutcome::failed(stdout, message),
            _ => AgentOutcome::failed(String::new(), message),
        }
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// `status` is "code N" or "signal"
    #[error("Exited with {status}: {stderr}")]
    Exit {
        status: String,
        stderr: String,
        stdout: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run ledger: {0}")]
    Ledger(String),

    /// The invocation task panicked or was cancelled
    #[error("Agent invocation aborted: {0}")]
    Aborted(String),

    #[error("Runner stopped")]
    Stopped,
}
