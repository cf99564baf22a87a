//! contextd-runner - serialized Claude CLI invocations
//!
//! Runs `claude -p` for knowledge extraction, one process at a time, recording every run in a
//! [`RunLedger`].
//!
//! # Example
//!
//! ```no_run
//! use contextd_runner::{AgentRequest, ClaudeRunner, SerialRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = SerialRunner::new(Arc::new(ClaudeRunner::new()), None);
//!     let outcome = runner
//!         .submit(AgentRequest::new("summary", "Summarize the last commit"))
//!         .await;
//!     println!("{}: {}", outcome.success, outcome.output);
//! }
//! ```

mod resolver;
mod runner;
mod serial;
mod structured;
mod types;

pub use resolver::{
    default_candidates, resolve_agent_binary, resolve_from_environment, AGENT_BIN_ENV,
    FALLBACK_BINARY,
};
pub use runner::{AgentInvoker, ClaudeRunner};
pub use serial::{Completed, RunLedger, SerialRunner};
pub use structured::parse_structured_output;
pub use types::*;
