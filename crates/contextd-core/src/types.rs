//! Core types for contextd
//!
//! Shared between the store, the queue, the diff pipeline and the scorer.

use serde::{Deserialize, Serialize};

// ============ Event Queue ============

/// Kind of event written to the event log by session hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    FileAccess,
    SessionEnd,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::FileAccess => "file_access",
            QueueEventKind::SessionEnd => "session_end",
        }
    }
}

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_ref: Option<String>,
    /// Epoch milliseconds. Also the event identity.
    pub timestamp: i64,
    #[serde(default)]
    pub processed: bool,
}

// ============ Diffs ============

/// How a file changed in a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
            ChangeType::Renamed => "renamed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeType::Added),
            "modified" => Some(ChangeType::Modified),
            "deleted" => Some(ChangeType::Deleted),
            "renamed" => Some(ChangeType::Renamed),
            _ => None,
        }
    }
}

/// Classification of a single diff line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Add,
    Remove,
    Context,
}

/// A line inside a hunk. `line_number` is in new-file coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub kind: LineKind,
    pub content: String,
    pub line_number: u32,
}

/// A contiguous block of changes sharing one `@@` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    pub fn added(&self) -> u32 {
        self.lines.iter().filter(|l| l.kind == LineKind::Add).count() as u32
    }

    pub fn removed(&self) -> u32 {
        self.lines.iter().filter(|l| l.kind == LineKind::Remove).count() as u32
    }
}

/// All hunks for one file of a unified diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDiff {
    pub file_path: String,
    pub change_type: ChangeType,
    pub hunks: Vec<DiffHunk>,
    pub lines_added: u32,
    pub lines_removed: u32,
}

impl ParsedDiff {
    /// Content of every added line, in order
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| l.kind == LineKind::Add)
            .map(|l| l.content.as_str())
    }
}

/// Hunks attributed to one enclosing function or class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionChunk {
    pub function_name: String,
    pub start_line: u32,
    pub hunks: Vec<DiffHunk>,
    pub lines_added: u32,
    pub lines_removed: u32,
}

// ============ Knowledge ============

/// Severity of a learning, also reused as priority for unfinished work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

/// The record types that carry a full-text shadow index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeKind {
    Session,
    Decision,
    Error,
    Learning,
    Unfinished,
}

impl KnowledgeKind {
    pub const ALL: [KnowledgeKind; 5] = [
        KnowledgeKind::Session,
        KnowledgeKind::Decision,
        KnowledgeKind::Error,
        KnowledgeKind::Learning,
        KnowledgeKind::Unfinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeKind::Session => "session",
            KnowledgeKind::Decision => "decision",
            KnowledgeKind::Error => "error",
            KnowledgeKind::Learning => "learning",
            KnowledgeKind::Unfinished => "unfinished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "session" => Some(KnowledgeKind::Session),
            "decision" => Some(KnowledgeKind::Decision),
            "error" => Some(KnowledgeKind::Error),
            "learning" => Some(KnowledgeKind::Learning),
            "unfinished" => Some(KnowledgeKind::Unfinished),
            _ => None,
        }
    }
}

/// Read-tracking and archival columns shared by every knowledge record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    pub access_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

/// A finished coding session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: String,
    pub summary: String,
    pub files_touched: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub ended_at: String,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// Input for recording a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub session_id: String,
    pub summary: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

/// An architectural or implementation decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub files: Vec<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDecision {
    #[serde(default)]
    pub session_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// An error seen during a session, deduplicated by signature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: i64,
    pub signature: String,
    pub message: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    pub occurrences: i64,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewError {
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub fix: Option<String>,
}

/// An anti-pattern paired with the pattern to use instead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningRecord {
    pub id: i64,
    pub anti_pattern: String,
    pub correct_pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub severity: Severity,
    pub auto_block: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_pattern: Option<String>,
    pub occurrences: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLearning {
    pub anti_pattern: String,
    pub correct_pattern: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub auto_block: bool,
    #[serde(default)]
    pub detection_pattern: Option<String>,
}

/// Work left open at the end of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnfinishedRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub description: String,
    pub priority: Severity,
    pub files: Vec<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUnfinished {
    #[serde(default)]
    pub session_id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub priority: Severity,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Outcome of an insert that may have been folded into an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    Merged(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Merged(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// A full-text search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub kind: KnowledgeKind,
    pub id: i64,
    pub snippet: String,
    pub rank: f64,
}

// ============ Audit ============

/// A stored per-file diff summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub file_path: String,
    pub change_type: ChangeType,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub functions: Vec<String>,
    pub created_at: String,
}

/// A dependency observed in a file's imports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRecord {
    pub id: i64,
    pub file_path: String,
    pub name: String,
    pub occurrences: i64,
    pub first_seen: String,
    pub last_seen: String,
}

/// One audited invocation of the external analysis tool.
/// `success` is `None` while the run is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRecord {
    pub id: i64,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_saved: Option<i64>,
}

/// Periodic daemon health sample
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub taken_at: String,
    pub pending_events: i64,
    pub runner_queue_depth: i64,
    pub runs_last_hour: i64,
    pub failed_runs_last_hour: i64,
    pub live_records: i64,
}

/// Row counts per table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub sessions: i64,
    pub decisions: i64,
    pub errors: i64,
    pub learnings: i64,
    pub unfinished: i64,
    pub archived: i64,
    pub diffs: i64,
    pub dependencies: i64,
    pub agent_runs: i64,
}

impl StoreStats {
    pub fn live_records(&self) -> i64 {
        self.sessions + self.decisions + self.errors + self.learnings + self.unfinished
            - self.archived
    }
}

// ============ Scoring ============

/// One piece of evidence competing for space in the context block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    pub kind: KnowledgeKind,
    pub content: String,
    pub score: u32,
    pub id: i64,
    /// Learning auto-block flag; false for other kinds
    #[serde(default)]
    pub flagged: bool,
}
