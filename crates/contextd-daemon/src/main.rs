//! contextd - session memory daemon
//!
//! Watches the hook event log, records diffs and session knowledge, and assembles context
//! blocks for new sessions.
//!
//! Usage:
//!   contextd --project <dir>            run the daemon (default)
//!   contextd context --file src/a.rs    print the context block for a working set

mod config;
mod orchestrator;
mod summarizer;
mod vcs;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{data_dir_from, DaemonConfig};
use contextd_core::context::DEFAULT_MAX_TOKENS;
use contextd_core::{ContextBuilder, ContextRequest, EventQueue, KnowledgeStore};
use contextd_runner::{ClaudeRunner, SerialRunner};
use orchestrator::Orchestrator;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use summarizer::{HttpSummarizer, NoopSummarizer, Summarizer};
use tracing::{info, warn};
use vcs::GitCli;

#[derive(Parser, Debug)]
#[command(name = "contextd")]
#[command(about = "Session memory and context assembly daemon")]
#[command(version)]
struct Cli {
    /// Project directory (overrides CONTEXTD_PROJECT_DIR)
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the event log and process events until interrupted
    Run,

    /// Print the context block for a working set
    Context {
        /// Files in the working set (repeatable)
        #[arg(short, long = "file")]
        files: Vec<String>,

        /// Token budget for the block
        #[arg(short, long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: usize,

        /// Print the scored items as JSON instead of the rendered block
        #[arg(long)]
        json: bool,
    },
}

fn log_level(env: &HashMap<String, String>) -> String {
    if let Some(v) = env.get("RUST_LOG") {
        v.clone()
    } else if let Some(v) = env.get("CONTEXTD_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    }
}

fn log_filter(env: &HashMap<String, String>) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(log_level(env))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

/// Tighten files that may carry paths or keys to owner-only access
#[cfg(unix)]
fn ensure_private_permissions(config: &DaemonConfig) {
    use std::os::unix::fs::PermissionsExt;

    for path in [config.data_dir.join("config.yaml"), config.db_path.clone()] {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                file = %path.display(),
                old_mode = format!("{:o}", mode),
                "File too permissive, fixing to 600"
            );
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).ok();
        }
    }
}

fn open_store(path: &Path) -> Result<KnowledgeStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    KnowledgeStore::open(path).with_context(|| format!("Failed to open store {}", path.display()))
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let store = Arc::new(open_store(&config.db_path)?);
    info!(
        db = %config.db_path.display(),
        schema_version = store.schema_version()?,
        "Knowledge store ready"
    );
    #[cfg(unix)]
    ensure_private_permissions(&config);

    let claude = ClaudeRunner::new()
        .default_timeout(config.agent_timeout)
        .default_model(config.model.clone());
    info!(binary = %claude.binary().display(), timeout = ?config.agent_timeout, "Agent runner ready");
    let runner = Arc::new(SerialRunner::new(Arc::new(claude), Some(store.clone())));

    let summarizer: Arc<dyn Summarizer> = match &config.api_key {
        Some(key) => Arc::new(
            HttpSummarizer::new(
                config.summary_url.clone(),
                config.summary_model.clone(),
                key.clone(),
                config.summary_max_tokens,
            )
            .context("Failed to build HTTP client")?,
        ),
        None => {
            info!("ANTHROPIC_API_KEY not set, sessions get mechanical summaries");
            Arc::new(NoopSummarizer)
        }
    };

    let orchestrator = Orchestrator::new(
        EventQueue::new(&config.event_log),
        store,
        runner,
        Arc::new(GitCli::new(&config.project_dir)),
        summarizer,
        &config.project_dir,
    );
    info!(
        project = %config.project_dir.display(),
        event_log = %config.event_log.display(),
        logs = %config.logs_dir().display(),
        "contextd started"
    );

    orchestrator
        .run_until(config.poll_interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl-C handler unavailable, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;
    info!("contextd stopped");
    Ok(())
}

fn print_context(config: &DaemonConfig, files: Vec<String>, max_tokens: usize, json: bool) -> Result<()> {
    let store = open_store(&config.db_path)?;
    let working_set = files
        .into_iter()
        .map(|f| {
            Path::new(&f)
                .strip_prefix(&config.project_dir)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(f)
        })
        .collect();
    let request = ContextRequest {
        max_tokens,
        ..ContextRequest::new(working_set)
    };
    let block = ContextBuilder::default().build(&store, &request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&block)?);
    } else if !block.is_empty() {
        println!("{}", block.text);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = data_dir_from(&env).join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "contextd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter(&env))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config = DaemonConfig::resolve(&env, cli.project)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Context {
            files,
            max_tokens,
            json,
        } => print_context(&config, files, max_tokens, json),
    }
}
