//! JSONL event queue
//!
//! Session hooks append one JSON object per line to the event log. The daemon hands out new
//! lines through an in-memory delivery cursor and flips `processed` in place once an event has
//! been dispatched. `<log>.cursor` records how far the log is settled (every earlier line
//! processed) and is written only after an acknowledgement lands, so a restart redelivers
//! anything that was read but never marked. When every line is processed the log is truncated.
//!
//! Rewrites hold an exclusive lock on `<log>.lock`. Writers that go through [`EventQueue::append`]
//! take the same lock and can never land between the rewrite's read and its rename.

use crate::types::QueueEvent;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Attempts at rewriting the log before giving up on a concurrent append
const REWRITE_ATTEMPTS: usize = 3;

/// Position in the event log.
///
/// `head_timestamp` fingerprints the first event so a log that was truncated and regrown past
/// the old length is still detected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    lines: usize,
    head_timestamp: Option<i64>,
}

impl Cursor {
    /// Whether this cursor still describes a log with these lines and head
    fn fits(&self, lines: usize, head: Option<i64>) -> bool {
        lines >= self.lines && (self.lines == 0 || self.head_timestamp == head)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// `None` until the first read of this process
    delivered: Option<Cursor>,
    /// Delivered events whose acknowledgement has not reached the log yet
    unacked: HashSet<i64>,
}

/// Held while the log is rewritten or appended to; released on drop
struct LogLock {
    file: std::fs::File,
}

impl Drop for LogLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Lines terminated by `\n`. A trailing unterminated line is still being written.
fn complete_lines(content: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = content.split('\n').collect();
    lines.pop();
    lines
}

fn parse_event(line: &str) -> Option<QueueEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn head_timestamp(lines: &[&str]) -> Option<i64> {
    lines.iter().find_map(|l| parse_event(l)).map(|e| e.timestamp)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub struct EventQueue {
    log_path: PathBuf,
    cursor_path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        let log_path = log_path.into();
        Self {
            cursor_path: with_suffix(&log_path, ".cursor"),
            lock_path: with_suffix(&log_path, ".lock"),
            log_path,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn lock(&self) -> Result<LogLock> {
        let path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || -> Result<LogLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("open event log lock {}", path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("acquire event log lock {}", path.display()))?;
            Ok(LogLock { file })
        })
        .await
        .context("join event log lock task")?
    }

    /// Append one event as a single line under the log lock
    pub async fn append(&self, event: &QueueEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let _lock = self.lock().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Unprocessed events appended since the previous read, in file order.
    ///
    /// The first read of a process starts from the settled position in `<log>.cursor`, so events
    /// delivered before a restart but never acknowledged come back. Failures are logged and read
    /// as "no events".
    pub async fn read(&self) -> Vec<QueueEvent> {
        let mut state = self.state.lock().await;
        match self.try_read(&mut state).await {
            Ok(events) => events,
            Err(e) => {
                warn!(path = %self.log_path.display(), error = %e, "Event log read failed");
                Vec::new()
            }
        }
    }

    async fn try_read(&self, state: &mut QueueState) -> Result<Vec<QueueEvent>> {
        let content = match fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines = complete_lines(&content);
        let head = head_timestamp(&lines);

        let mut cursor = match &state.delivered {
            Some(cursor) => cursor.clone(),
            None => self.load_cursor().await,
        };
        if !cursor.fits(lines.len(), head) {
            info!(
                previous = cursor.lines,
                current = lines.len(),
                "Event log was truncated or replaced, rescanning from start"
            );
            cursor = Cursor::default();
        }

        let events: Vec<QueueEvent> = lines[cursor.lines..]
            .iter()
            .filter_map(|l| {
                let event = parse_event(l);
                if event.is_none() && !l.trim().is_empty() {
                    debug!(line = %l, "Skipping malformed event line");
                }
                event
            })
            .filter(|e| !e.processed && !state.unacked.contains(&e.timestamp))
            .collect();

        state.delivered = Some(Cursor {
            lines: lines.len(),
            head_timestamp: head,
        });
        Ok(events)
    }

    async fn load_cursor(&self) -> Cursor {
        match fs::read_to_string(&self.cursor_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt event cursor, starting over");
                Cursor::default()
            }),
            Err(_) => Cursor::default(),
        }
    }

    async fn store_cursor(&self, cursor: &Cursor) {
        let result = match serde_json::to_string(cursor) {
            Ok(raw) => fs::write(&self.cursor_path, raw).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            // only costs a longer rescan after a restart
            warn!(path = %self.cursor_path.display(), error = %e, "Failed to persist event cursor");
        }
    }

    /// Flip `processed` on the lines whose timestamp belongs to `events`.
    ///
    /// Other lines are written back unchanged. Returns how many lines were flipped. If no
    /// unprocessed line remains afterwards, the log is truncated and the cursor reset.
    ///
    /// Acknowledgements that could not be written (an error, or a log that kept growing) are
    /// kept and retried with the next call, which may pass an empty slice.
    pub async fn mark_processed(&self, events: &[QueueEvent]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut stamps = std::mem::take(&mut state.unacked);
        stamps.extend(events.iter().map(|e| e.timestamp));
        if stamps.is_empty() {
            return Ok(0);
        }

        match self.rewrite(&stamps).await {
            Ok(Some(rewrite)) => {
                if rewrite.drained {
                    state.delivered = Some(Cursor::default());
                    debug!(flipped = rewrite.flipped, "Event log fully processed, rotated");
                }
                self.store_cursor(&rewrite.settled).await;
                Ok(rewrite.flipped)
            }
            Ok(None) => {
                warn!(
                    pending = stamps.len(),
                    "Event log kept growing during rewrite, will retry next tick"
                );
                state.unacked = stamps;
                Ok(0)
            }
            Err(e) => {
                state.unacked = stamps;
                Err(e)
            }
        }
    }

    /// `None` when the log grew under every attempt
    async fn rewrite(&self, stamps: &HashSet<i64>) -> Result<Option<Rewrite>> {
        let _lock = self.lock().await?;
        let tmp = with_suffix(&self.log_path, ".tmp");

        for attempt in 1..=REWRITE_ATTEMPTS {
            let content = match fs::read_to_string(&self.log_path).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Ok(Some(Rewrite::default()));
                }
                Err(e) => return Err(e.into()),
            };
            let rewrite = rewrite_processed(&content, stamps);
            let new_body = if rewrite.drained { "" } else { rewrite.body.as_str() };
            fs::write(&tmp, new_body).await?;

            // a writer that skips the lock appended since our read; start over with the longer file
            let current_len = fs::metadata(&self.log_path).await?.len();
            if current_len != content.len() as u64 {
                let _ = fs::remove_file(&tmp).await;
                debug!(attempt, "Event log grew during rewrite, retrying");
                continue;
            }

            fs::rename(&tmp, &self.log_path).await?;
            return Ok(Some(rewrite));
        }
        Ok(None)
    }

    /// Number of unprocessed events currently in the log
    pub async fn pending_count(&self) -> usize {
        match fs::read_to_string(&self.log_path).await {
            Ok(content) => complete_lines(&content)
                .iter()
                .filter_map(|l| parse_event(l))
                .filter(|e| !e.processed)
                .count(),
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Rewrite {
    body: String,
    flipped: usize,
    /// Nothing unprocessed remains; the log is emptied
    drained: bool,
    /// Leading lines that need no further delivery
    settled: Cursor,
}

fn rewrite_processed(content: &str, stamps: &HashSet<i64>) -> Rewrite {
    let mut body = String::with_capacity(content.len() + stamps.len() * 20);
    let mut flipped = 0;
    let mut drained = true;
    let mut settled_lines = 0;
    let mut head: Option<i64> = None;

    for segment in content.split_inclusive('\n') {
        let Some(line) = segment.strip_suffix('\n') else {
            // partial trailing line: keep it and don't rotate under the writer
            body.push_str(segment);
            drained = false;
            continue;
        };

        let mut object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => object,
            _ => {
                body.push_str(segment);
                if drained {
                    settled_lines += 1;
                }
                continue;
            }
        };
        let timestamp = object.get("timestamp").and_then(Value::as_i64);
        if head.is_none() && parse_event(line).is_some() {
            head = timestamp;
        }
        let already = object.get("processed").and_then(Value::as_bool).unwrap_or(false);
        let matches = timestamp.is_some_and(|ts| stamps.contains(&ts));

        if matches && !already {
            object.insert("processed".to_string(), Value::Bool(true));
            body.push_str(&Value::Object(object).to_string());
            body.push('\n');
            flipped += 1;
        } else {
            body.push_str(segment);
            if !already {
                drained = false;
            }
        }
        if drained {
            settled_lines += 1;
        }
    }

    let drained = drained && flipped > 0;
    let settled = if drained {
        Cursor::default()
    } else {
        Cursor {
            lines: settled_lines,
            head_timestamp: head,
        }
    };
    Rewrite {
        body,
        flipped,
        drained,
        settled,
    }
}
