//! Event dispatch loop
//!
//! Polls the event log, keeps per-session working sets, and fans each event out into
//! independent tasks: diff recording for file accesses, summary and knowledge extraction for
//! session ends.

use crate::config::HEALTH_EVERY_TICKS;
use crate::summarizer::{truncate_tail, Summarizer, MAX_SUMMARY_INPUT_CHARS};
use crate::vcs::VersionControl;
use anyhow::Result;
use chrono::Utc;
use contextd_core::diff::{chunk_by_function, parse_diff, scan_imports};
use contextd_core::{
    EventQueue, HealthSnapshot, KnowledgeStore, NewDecision, NewError, NewLearning, NewSession,
    NewUnfinished, QueueEvent, QueueEventKind,
};
use contextd_runner::{parse_structured_output, AgentRequest, SerialRunner};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const EXTRACTOR_AGENT: &str = "knowledge-extractor";

/// How long shutdown waits for in-flight tasks before aborting them
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Files touched by one live session, in first-access order
#[derive(Debug, Clone)]
struct WorkingSet {
    files: Vec<String>,
    started_at: String,
}

impl WorkingSet {
    fn new() -> Self {
        Self {
            files: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
        }
    }

    fn add(&mut self, file: String) {
        if !self.files.contains(&file) {
            self.files.push(file);
        }
    }
}

/// Shape the extraction agent is asked to return
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Extraction {
    decisions: Vec<NewDecision>,
    errors: Vec<NewError>,
    learnings: Vec<NewLearning>,
    unfinished: Vec<NewUnfinished>,
}

impl Extraction {
    fn len(&self) -> usize {
        self.decisions.len() + self.errors.len() + self.learnings.len() + self.unfinished.len()
    }
}

fn extraction_schema() -> Value {
    let files = json!({"type": "array", "items": {"type": "string"}});
    let level = json!({"type": "string", "enum": ["high", "medium", "low"]});
    json!({
        "type": "object",
        "properties": {
            "decisions": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "rationale": {"type": "string"},
                    "files": files,
                },
                "required": ["title"],
            }},
            "errors": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "fix": {"type": "string"},
                    "files": files,
                },
                "required": ["message"],
            }},
            "learnings": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "antiPattern": {"type": "string"},
                    "correctPattern": {"type": "string"},
                    "context": {"type": "string"},
                    "severity": level,
                    "autoBlock": {"type": "boolean"},
                    "detectionPattern": {"type": "string"},
                },
                "required": ["antiPattern", "correctPattern"],
            }},
            "unfinished": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "priority": level,
                    "files": files,
                },
                "required": ["description"],
            }},
        },
        "required": ["decisions", "errors", "learnings", "unfinished"],
    })
}

fn extraction_prompt(files: &[String], transcript: &str) -> String {
    let files = if files.is_empty() {
        "(none recorded)".to_string()
    } else {
        files.join(", ")
    };
    format!(
        "Extract durable project knowledge from this coding session transcript.\n\
         Report architectural decisions, errors hit (with the fix if one was found), \
         anti-patterns to avoid next time, and work left unfinished. \
         Return empty arrays when there is nothing worth keeping.\n\n\
         Files touched: {}\n\n<transcript>\n{}\n</transcript>",
        files, transcript
    )
}

/// Summary used when the summarizer is unavailable or fails
fn fallback_summary(files: &[String]) -> String {
    const SHOWN: usize = 10;
    match files.len() {
        0 => "Session ended with no recorded file changes".to_string(),
        n if n <= SHOWN => format!("Worked on {} file(s): {}", n, files.join(", ")),
        n => format!(
            "Worked on {} files: {}, and {} more",
            n,
            files[..SHOWN].join(", "),
            n - SHOWN
        ),
    }
}

/// Project-relative form of `file` when it lives under `root`
fn relative_to(root: &Path, file: &str) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| file.to_string())
}

async fn load_transcript(path: Option<&str>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(text) => truncate_tail(&text, MAX_SUMMARY_INPUT_CHARS).to_string(),
        Err(e) => {
            warn!(path, error = %e, "Transcript unreadable, continuing without it");
            String::new()
        }
    }
}

/// Collaborators shared with spawned tasks
struct Shared {
    store: Arc<KnowledgeStore>,
    runner: Arc<SerialRunner>,
    vcs: Arc<dyn VersionControl>,
    summarizer: Arc<dyn Summarizer>,
    project_dir: PathBuf,
}

pub struct Orchestrator {
    queue: EventQueue,
    shared: Arc<Shared>,
    working_sets: HashMap<String, WorkingSet>,
    tasks: Vec<JoinHandle<()>>,
    ticks: u64,
}

impl Orchestrator {
    pub fn new(
        queue: EventQueue,
        store: Arc<KnowledgeStore>,
        runner: Arc<SerialRunner>,
        vcs: Arc<dyn VersionControl>,
        summarizer: Arc<dyn Summarizer>,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            shared: Arc::new(Shared {
                store,
                runner,
                vcs,
                summarizer,
                project_dir: project_dir.into(),
            }),
            working_sets: HashMap::new(),
            tasks: Vec::new(),
            ticks: 0,
        }
    }

    /// Tick every `poll` until `shutdown` resolves, then drain in-flight tasks
    pub async fn run_until(mut self, poll: Duration, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(poll_ms = poll.as_millis() as u64, "Orchestrator started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
        self.drain(DRAIN_TIMEOUT).await;
    }

    /// One poll: read, dispatch, mark processed, maybe snapshot health.
    /// Returns the number of events dispatched.
    pub async fn tick(&mut self) -> usize {
        self.ticks += 1;
        self.tasks.retain(|h| !h.is_finished());

        let events = self.queue.read().await;
        for event in &events {
            self.dispatch(event);
        }
        // runs on idle ticks too, to retry acknowledgements that failed earlier
        match self.queue.mark_processed(&events).await {
            Ok(0) if events.is_empty() => {}
            Ok(flipped) => debug!(count = events.len(), flipped, "Events dispatched"),
            Err(e) => warn!(error = %e, "Failed to mark events processed"),
        }

        if self.ticks % HEALTH_EVERY_TICKS == 0 {
            if let Err(e) = self.record_health().await {
                warn!(error = %e, "Health snapshot failed");
            }
        }
        events.len()
    }

    fn dispatch(&mut self, event: &QueueEvent) {
        match event.kind {
            QueueEventKind::FileAccess => {
                let Some(file) = event.file.as_deref() else {
                    debug!(session_id = %event.session_id, "file_access without a file, skipped");
                    return;
                };
                let file = relative_to(&self.shared.project_dir, file);
                self.working_sets
                    .entry(event.session_id.clone())
                    .or_insert_with(WorkingSet::new)
                    .add(file.clone());

                let shared = self.shared.clone();
                let session_id = event.session_id.clone();
                self.tasks.push(tokio::spawn(async move {
                    if let Err(e) = record_file_change(&shared, &session_id, &file).await {
                        warn!(session_id = %session_id, file = %file, error = %e, "Diff recording failed");
                    }
                }));
            }
            QueueEventKind::SessionEnd => {
                let working_set = self
                    .working_sets
                    .remove(&event.session_id)
                    .unwrap_or_else(WorkingSet::new);
                info!(
                    session_id = %event.session_id,
                    files = working_set.files.len(),
                    "Session ended"
                );

                let shared = self.shared.clone();
                let session_id = event.session_id.clone();
                let transcript = event.transcript_ref.clone();
                let ws = working_set.clone();
                self.tasks.push(tokio::spawn(async move {
                    if let Err(e) = summarize_session(&shared, &session_id, transcript.as_deref(), &ws).await {
                        warn!(session_id = %session_id, error = %e, "Session summary failed");
                    }
                }));

                let shared = self.shared.clone();
                let session_id = event.session_id.clone();
                let transcript = event.transcript_ref.clone();
                self.tasks.push(tokio::spawn(async move {
                    if let Err(e) =
                        extract_knowledge(&shared, &session_id, transcript.as_deref(), &working_set.files).await
                    {
                        warn!(session_id = %session_id, error = %e, "Knowledge extraction failed");
                    }
                }));
            }
        }
    }

    async fn record_health(&self) -> Result<()> {
        let store = &self.shared.store;
        let since = Utc::now().timestamp_millis() - 3_600_000;
        let (runs, failed) = store.run_counts_since(since)?;
        let snapshot = HealthSnapshot {
            taken_at: Utc::now().to_rfc3339(),
            pending_events: self.queue.pending_count().await as i64,
            runner_queue_depth: self.shared.runner.queue_depth() as i64,
            runs_last_hour: runs,
            failed_runs_last_hour: failed,
            live_records: store.stats()?.live_records(),
        };
        store.record_health(&snapshot)?;
        debug!(?snapshot, "Health snapshot recorded");
        Ok(())
    }

    /// Sessions with file accesses but no end event yet
    pub fn open_sessions(&self) -> usize {
        self.working_sets.len()
    }

    /// Wait for spawned tasks, aborting whatever is still running after `limit`
    pub async fn drain(&mut self, limit: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(limit, all).await.is_err() {
            warn!("In-flight tasks did not finish in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

async fn record_file_change(shared: &Shared, session_id: &str, file: &str) -> Result<()> {
    let text = shared.vcs.diff(Some(file)).await?;
    let diffs = parse_diff(&text);
    if diffs.is_empty() {
        debug!(file, "No diff for accessed file");
        return Ok(());
    }

    let store = &shared.store;
    for diff in &diffs {
        let functions: Vec<String> = chunk_by_function(diff)
            .into_iter()
            .map(|c| c.function_name)
            .collect();
        store.record_diff(Some(session_id), diff, &functions)?;

        for name in scan_imports(diff.added_lines()) {
            store.record_dependency(&diff.file_path, &name)?;
        }

        if diff.lines_added > 0 {
            let added = diff.added_lines().collect::<Vec<_>>().join("\n");
            let blocked = store.check_blocked_patterns(&added)?;
            if !blocked.is_empty() {
                let patterns: Vec<&str> = blocked.iter().map(|l| l.anti_pattern.as_str()).collect();
                warn!(
                    session_id,
                    file = %diff.file_path,
                    ?patterns,
                    "New code matches blocked patterns"
                );
            }
        }
        debug!(
            file = %diff.file_path,
            added = diff.lines_added,
            removed = diff.lines_removed,
            functions = functions.len(),
            "Diff recorded"
        );
    }
    Ok(())
}

async fn summarize_session(
    shared: &Shared,
    session_id: &str,
    transcript_ref: Option<&str>,
    working_set: &WorkingSet,
) -> Result<()> {
    let transcript = load_transcript(transcript_ref).await;
    let title = format!("Session {}", session_id);
    let summary = match shared.summarizer.summarize(&title, &transcript).await {
        Some(summary) => summary,
        None => fallback_summary(&working_set.files),
    };
    let branch = match shared.vcs.current_branch().await {
        Ok(branch) => branch,
        Err(e) => {
            debug!(error = %e, "No branch for session");
            None
        }
    };

    shared.store.upsert_session(&NewSession {
        session_id: session_id.to_string(),
        summary,
        files_touched: working_set.files.clone(),
        branch,
        started_at: Some(working_set.started_at.clone()),
    })?;
    info!(session_id, "Session summary stored");
    Ok(())
}

async fn extract_knowledge(
    shared: &Shared,
    session_id: &str,
    transcript_ref: Option<&str>,
    files: &[String],
) -> Result<()> {
    let transcript = load_transcript(transcript_ref).await;
    if transcript.trim().is_empty() {
        debug!(session_id, "No transcript, skipping extraction");
        return Ok(());
    }

    let request = AgentRequest::new(EXTRACTOR_AGENT, extraction_prompt(files, &transcript))
        .session(session_id)
        .cwd(shared.project_dir.clone())
        .schema(extraction_schema());
    let completed = shared.runner.submit_tracked(request).await;
    if !completed.outcome.success {
        warn!(
            session_id,
            error = completed.outcome.error.as_deref().unwrap_or("unknown"),
            "Extraction agent failed"
        );
        return Ok(());
    }

    let Some(extraction) = parse_structured_output::<Extraction>(&completed.outcome.output) else {
        info!(session_id, "No findings this round");
        return Ok(());
    };
    debug!(session_id, found = extraction.len(), "Extraction parsed");

    let saved = persist_extraction(&shared.store, session_id, extraction);
    if let Some(run_id) = completed.run_id {
        shared.store.set_items_saved(run_id, saved as i64)?;
    }
    info!(session_id, saved, "Knowledge extracted");
    Ok(())
}

/// Store every item, skipping ones the store rejects. Returns how many were saved.
fn persist_extraction(store: &KnowledgeStore, session_id: &str, extraction: Extraction) -> usize {
    let mut saved = 0;
    let mut note = |what: &str, result: rusqlite::Result<()>| match result {
        Ok(()) => saved += 1,
        Err(e) => warn!(session_id, kind = what, error = %e, "Failed to store extracted item"),
    };

    for mut decision in extraction.decisions {
        decision.session_id.get_or_insert_with(|| session_id.to_string());
        note("decision", store.add_decision(&decision).map(drop));
    }
    for error in extraction.errors {
        note("error", store.record_error(&error).map(drop));
    }
    for learning in extraction.learnings {
        note("learning", store.add_learning(&learning).map(drop));
    }
    for mut item in extraction.unfinished {
        item.session_id.get_or_insert_with(|| session_id.to_string());
        note("unfinished", store.add_unfinished(&item).map(drop));
    }
    saved
}
