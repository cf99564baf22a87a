//! SQLite knowledge store
//!
//! One connection behind a mutex. Knowledge writes update the base table and its FTS5 index in
//! the same transaction; archiving only stamps `archived_at`.

mod audit;
mod index;
mod schema;

pub use audit::MAX_RUN_ERROR_CHARS;
pub use index::IndexDrift;

use crate::similarity::{find_similar, DEFAULT_SIMILARITY_THRESHOLD};
use crate::types::{
    DecisionRecord, ErrorRecord, KnowledgeKind, LearningRecord, Lifecycle, NewDecision, NewError,
    NewLearning, NewSession, NewUnfinished, SearchHit, SessionRecord, Severity, UnfinishedRecord,
    UpsertOutcome,
};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Params, Result as SqliteResult, Row};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Stable identity for an error message.
///
/// Lowercased, digit runs collapsed to `#`, whitespace normalized, then SHA-256.
pub fn error_signature(message: &str) -> String {
    let lowered = message.to_lowercase();
    let masked = DIGIT_RUN.replace_all(&lowered, "#");
    let normalized = masked.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Union preserving existing order, new entries appended
fn merge_files(mut existing: Vec<String>, incoming: &[String]) -> Vec<String> {
    for file in incoming {
        if !existing.contains(file) {
            existing.push(file.clone());
        }
    }
    existing
}

fn lifecycle(row: &Row) -> SqliteResult<Lifecycle> {
    Ok(Lifecycle {
        access_count: row.get("access_count")?,
        last_accessed: row.get("last_accessed")?,
        archived_at: row.get("archived_at")?,
    })
}

/// Persistent knowledge base
pub struct KnowledgeStore {
    conn: Mutex<Connection>,
    similarity_threshold: f64,
}

impl KnowledgeStore {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> SqliteResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqliteResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        };
        store.init()?;
        Ok(store)
    }

    /// Override the near-duplicate threshold used by [`add_learning`](Self::add_learning)
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&self) -> SqliteResult<()> {
        let mut conn = self.conn();
        conn.execute_batch(schema::SCHEMA)?;
        index::create_tables(&conn)?;
        let version = schema::migrate(&conn)?;

        let drift = index::drift(&conn)?;
        if drift.iter().any(|d| !d.is_consistent()) {
            let tx = conn.transaction()?;
            let indexed = index::rebuild(&tx)?;
            tx.commit()?;
            tracing::warn!(indexed, "Search index out of sync at startup, rebuilt");
        }
        tracing::debug!(version, "Knowledge store ready");
        Ok(())
    }

    pub fn schema_version(&self) -> SqliteResult<i64> {
        schema::current_version(&self.conn())
    }

    fn query_list<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row<'_>) -> SqliteResult<T>,
    ) -> SqliteResult<Vec<T>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        rows.collect()
    }

    // ============ Sessions ============

    /// Insert or replace the session keyed by `session_id`. Returns the row id.
    pub fn upsert_session(&self, input: &NewSession) -> SqliteResult<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (session_id, summary, files_touched, branch, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
               summary = excluded.summary,
               files_touched = excluded.files_touched,
               branch = COALESCE(excluded.branch, sessions.branch),
               started_at = COALESCE(sessions.started_at, excluded.started_at),
               ended_at = excluded.ended_at",
            params![
                input.session_id,
                input.summary,
                to_json(&input.files_touched),
                input.branch,
                input.started_at,
                now(),
            ],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM sessions WHERE session_id = ?1",
            params![input.session_id],
            |row| row.get(0),
        )?;
        index::sync_row(&tx, KnowledgeKind::Session, id)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_session(&self, session_id: &str) -> SqliteResult<Option<SessionRecord>> {
        self.conn()
            .query_row(
                "SELECT * FROM sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()
    }

    /// Live sessions, most recently ended first
    pub fn recent_sessions(&self, limit: usize) -> SqliteResult<Vec<SessionRecord>> {
        self.query_list(
            "SELECT * FROM sessions WHERE archived_at IS NULL ORDER BY ended_at DESC, id DESC LIMIT ?1",
            params![limit as i64],
            Self::row_to_session,
        )
    }

    fn row_to_session(row: &Row) -> SqliteResult<SessionRecord> {
        Ok(SessionRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            summary: row.get("summary")?,
            files_touched: from_json(row.get("files_touched")?),
            branch: row.get("branch")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            lifecycle: lifecycle(row)?,
        })
    }

    // ============ Decisions ============

    pub fn add_decision(&self, input: &NewDecision) -> SqliteResult<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO decisions (session_id, title, rationale, files, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                input.session_id,
                input.title,
                input.rationale,
                to_json(&input.files),
                now(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        index::sync_row(&tx, KnowledgeKind::Decision, id)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn recent_decisions(&self, limit: usize) -> SqliteResult<Vec<DecisionRecord>> {
        self.query_list(
            "SELECT * FROM decisions WHERE archived_at IS NULL ORDER BY created_at DESC, id DESC LIMIT ?1",
            params![limit as i64],
            Self::row_to_decision,
        )
    }

    fn row_to_decision(row: &Row) -> SqliteResult<DecisionRecord> {
        Ok(DecisionRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            title: row.get("title")?,
            rationale: row.get("rationale")?,
            files: from_json(row.get("files")?),
            created_at: row.get("created_at")?,
            lifecycle: lifecycle(row)?,
        })
    }

    // ============ Errors ============

    /// Record an error occurrence, folding repeats of the same signature into one row.
    ///
    /// On a repeat: occurrences +1, `last_seen` refreshed, files merged, and the stored fix
    /// kept unless a new one is supplied.
    pub fn record_error(&self, input: &NewError) -> SqliteResult<UpsertOutcome> {
        let signature = error_signature(&input.message);
        let ts = now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT id, files FROM errors WHERE signature = ?1",
                params![signature],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((id, files)) => {
                let files = merge_files(from_json(files), &input.files);
                tx.execute(
                    "UPDATE errors SET occurrences = occurrences + 1, last_seen = ?2, files = ?3,
                       fix = COALESCE(?4, fix)
                     WHERE id = ?1",
                    params![id, ts, to_json(&files), input.fix],
                )?;
                UpsertOutcome::Merged(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO errors (signature, message, files, fix, occurrences, first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                    params![signature, input.message, to_json(&input.files), input.fix, ts],
                )?;
                UpsertOutcome::Created(tx.last_insert_rowid())
            }
        };

        index::sync_row(&tx, KnowledgeKind::Error, outcome.id())?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Live errors ordered by frequency
    pub fn top_errors(&self, limit: usize) -> SqliteResult<Vec<ErrorRecord>> {
        self.query_list(
            "SELECT * FROM errors WHERE archived_at IS NULL
             ORDER BY occurrences DESC, last_seen DESC LIMIT ?1",
            params![limit as i64],
            Self::row_to_error,
        )
    }

    /// Live errors that mention any of `files`, most recent first
    pub fn errors_for_files(&self, files: &[String], limit: usize) -> SqliteResult<Vec<ErrorRecord>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let all = self.query_list(
            "SELECT * FROM errors WHERE archived_at IS NULL ORDER BY last_seen DESC",
            [],
            Self::row_to_error,
        )?;
        Ok(all
            .into_iter()
            .filter(|e| e.files.iter().any(|f| files.contains(f)))
            .take(limit)
            .collect())
    }

    fn row_to_error(row: &Row) -> SqliteResult<ErrorRecord> {
        Ok(ErrorRecord {
            id: row.get("id")?,
            signature: row.get("signature")?,
            message: row.get("message")?,
            files: from_json(row.get("files")?),
            fix: row.get("fix")?,
            occurrences: row.get("occurrences")?,
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
            lifecycle: lifecycle(row)?,
        })
    }

    // ============ Learnings ============

    /// Add a learning, or bump the occurrences of a live near-duplicate anti-pattern.
    ///
    /// An invalid `detection_pattern` is dropped with a warning rather than stored.
    pub fn add_learning(&self, input: &NewLearning) -> SqliteResult<UpsertOutcome> {
        let detection = input.detection_pattern.as_deref().filter(|p| {
            let valid = Regex::new(p).is_ok();
            if !valid {
                tracing::warn!(pattern = %p, "Dropping invalid detection pattern");
            }
            valid
        });
        let ts = now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let corpus: Vec<(i64, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, anti_pattern FROM learnings WHERE archived_at IS NULL")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<SqliteResult<_>>()?
        };

        let outcome = match find_similar(&input.anti_pattern, &corpus, self.similarity_threshold).first() {
            Some(hit) => {
                tx.execute(
                    "UPDATE learnings SET occurrences = occurrences + 1, updated_at = ?2,
                       auto_block = MAX(auto_block, ?3),
                       detection_pattern = COALESCE(detection_pattern, ?4)
                     WHERE id = ?1",
                    params![hit.id, ts, input.auto_block, detection],
                )?;
                tracing::debug!(id = hit.id, score = hit.score, "Merged near-duplicate learning");
                UpsertOutcome::Merged(hit.id)
            }
            None => {
                tx.execute(
                    "INSERT INTO learnings (anti_pattern, correct_pattern, context, severity,
                       auto_block, detection_pattern, occurrences, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
                    params![
                        input.anti_pattern,
                        input.correct_pattern,
                        input.context,
                        input.severity.as_str(),
                        input.auto_block,
                        detection,
                        ts,
                    ],
                )?;
                UpsertOutcome::Created(tx.last_insert_rowid())
            }
        };

        index::sync_row(&tx, KnowledgeKind::Learning, outcome.id())?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Live learnings, most reinforced first
    pub fn learnings(&self, limit: usize) -> SqliteResult<Vec<LearningRecord>> {
        self.query_list(
            "SELECT * FROM learnings WHERE archived_at IS NULL
             ORDER BY auto_block DESC, occurrences DESC, updated_at DESC LIMIT ?1",
            params![limit as i64],
            Self::row_to_learning,
        )
    }

    /// Live learnings flagged for auto-block
    pub fn blocking_learnings(&self) -> SqliteResult<Vec<LearningRecord>> {
        self.query_list(
            "SELECT * FROM learnings WHERE archived_at IS NULL AND auto_block = 1
             ORDER BY occurrences DESC",
            [],
            Self::row_to_learning,
        )
    }

    /// Live learnings whose detection pattern matches `text`
    pub fn check_blocked_patterns(&self, text: &str) -> SqliteResult<Vec<LearningRecord>> {
        let candidates = self.query_list(
            "SELECT * FROM learnings WHERE archived_at IS NULL AND detection_pattern IS NOT NULL
             ORDER BY auto_block DESC, occurrences DESC",
            [],
            Self::row_to_learning,
        )?;
        Ok(candidates
            .into_iter()
            .filter(|l| {
                l.detection_pattern
                    .as_deref()
                    .and_then(|p| Regex::new(p).ok())
                    .is_some_and(|re| re.is_match(text))
            })
            .collect())
    }

    fn row_to_learning(row: &Row) -> SqliteResult<LearningRecord> {
        let severity: String = row.get("severity")?;
        Ok(LearningRecord {
            id: row.get("id")?,
            anti_pattern: row.get("anti_pattern")?,
            correct_pattern: row.get("correct_pattern")?,
            context: row.get("context")?,
            severity: Severity::from_str(&severity).unwrap_or_default(),
            auto_block: row.get::<_, i64>("auto_block")? != 0,
            detection_pattern: row.get("detection_pattern")?,
            occurrences: row.get("occurrences")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            lifecycle: lifecycle(row)?,
        })
    }

    // ============ Unfinished ============

    pub fn add_unfinished(&self, input: &NewUnfinished) -> SqliteResult<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO unfinished (session_id, description, priority, files, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                input.session_id,
                input.description,
                input.priority.as_str(),
                to_json(&input.files),
                now(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        index::sync_row(&tx, KnowledgeKind::Unfinished, id)?;
        tx.commit()?;
        Ok(id)
    }

    /// Live unfinished work, high priority first
    pub fn open_unfinished(&self, limit: usize) -> SqliteResult<Vec<UnfinishedRecord>> {
        self.query_list(
            "SELECT * FROM unfinished WHERE archived_at IS NULL
             ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                      created_at DESC, id DESC
             LIMIT ?1",
            params![limit as i64],
            Self::row_to_unfinished,
        )
    }

    fn row_to_unfinished(row: &Row) -> SqliteResult<UnfinishedRecord> {
        let priority: String = row.get("priority")?;
        Ok(UnfinishedRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            description: row.get("description")?,
            priority: Severity::from_str(&priority).unwrap_or_default(),
            files: from_json(row.get("files")?),
            created_at: row.get("created_at")?,
            lifecycle: lifecycle(row)?,
        })
    }

    // ============ Lifecycle ============

    /// Soft-delete. The index row stays; search filters on `archived_at`.
    pub fn archive(&self, kind: KnowledgeKind, id: i64) -> SqliteResult<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET archived_at = ?2 WHERE id = ?1 AND archived_at IS NULL",
                index::table_for(kind).table
            ),
            params![id, now()],
        )?;
        Ok(changed > 0)
    }

    /// Hard-delete the base row and its index row together
    pub fn delete(&self, kind: KnowledgeKind, id: i64) -> SqliteResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", index::table_for(kind).table),
            params![id],
        )?;
        index::remove_row(&tx, kind, id)?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Bump read-tracking for records that were served to a caller
    pub fn touch(&self, kind: KnowledgeKind, ids: &[i64]) -> SqliteResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn();
        let ts = now();
        let mut stmt = conn.prepare(&format!(
            "UPDATE {} SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            index::table_for(kind).table
        ))?;
        for id in ids {
            stmt.execute(params![ts, id])?;
        }
        Ok(())
    }

    // ============ Search & index ============

    /// Full-text search across every knowledge kind, best matches first
    pub fn search(&self, query: &str, limit: usize) -> SqliteResult<Vec<SearchHit>> {
        index::search(&self.conn(), query, limit)
    }

    pub fn verify_index_consistency(&self) -> SqliteResult<Vec<IndexDrift>> {
        index::drift(&self.conn())
    }

    /// Repopulate every search index from its base table. Returns the rows indexed.
    pub fn rebuild_index(&self) -> SqliteResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let indexed = index::rebuild(&tx)?;
        tx.commit()?;
        tracing::info!(indexed, "Search index rebuilt");
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KnowledgeStore {
        KnowledgeStore::in_memory().unwrap()
    }

    fn files(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn assert_index_consistent(store: &KnowledgeStore) {
        for drift in store.verify_index_consistency().unwrap() {
            assert!(drift.is_consistent(), "{:?}", drift);
        }
    }

    #[test]
    fn test_error_signature_normalization() {
        let a = error_signature("TypeError at line 42:   cannot read 'x'");
        let b = error_signature("typeerror at line 7: cannot read 'x'");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, error_signature("TypeError at line 42: cannot read 'y'"));
    }

    #[test]
    fn test_error_signature_distinguishes_long_messages_with_shared_prefix() {
        let prefix = "x".repeat(120);
        assert_ne!(
            error_signature(&format!("{} alpha", prefix)),
            error_signature(&format!("{} beta", prefix))
        );
    }

    #[test]
    fn test_schema_version_current() {
        let store = store();
        assert_eq!(store.schema_version().unwrap(), 4);
    }

    #[test]
    fn test_upsert_session_replaces_and_keeps_branch() {
        let store = store();
        let id = store
            .upsert_session(&NewSession {
                session_id: "s1".into(),
                summary: "first pass".into(),
                files_touched: files(&["src/a.rs"]),
                branch: Some("main".into()),
                started_at: None,
            })
            .unwrap();
        let again = store
            .upsert_session(&NewSession {
                session_id: "s1".into(),
                summary: "second pass".into(),
                files_touched: files(&["src/a.rs", "src/b.rs"]),
                branch: None,
                started_at: None,
            })
            .unwrap();
        assert_eq!(id, again);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.summary, "second pass");
        assert_eq!(session.files_touched.len(), 2);
        assert_eq!(session.branch.as_deref(), Some("main"));
        assert!(store.get_session("missing").unwrap().is_none());
        assert_index_consistent(&store);

        let hits = store.search("second", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, KnowledgeKind::Session);
        assert!(store.search("first", 10).unwrap().is_empty());
    }

    #[test]
    fn test_record_error_folds_repeats() {
        let store = store();
        let first = store
            .record_error(&NewError {
                message: "panic at src/db.rs:120 index out of bounds".into(),
                files: files(&["src/db.rs"]),
                fix: Some("check length first".into()),
            })
            .unwrap();
        let second = store
            .record_error(&NewError {
                message: "panic at src/db.rs:131 index out of bounds".into(),
                files: files(&["src/queue.rs"]),
                fix: None,
            })
            .unwrap();
        assert!(first.is_created());
        assert_eq!(second, UpsertOutcome::Merged(first.id()));

        let errors = store.top_errors(10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].occurrences, 2);
        assert_eq!(errors[0].files, files(&["src/db.rs", "src/queue.rs"]));
        assert_eq!(errors[0].fix.as_deref(), Some("check length first"));

        let for_queue = store.errors_for_files(&files(&["src/queue.rs"]), 5).unwrap();
        assert_eq!(for_queue.len(), 1);
        assert!(store.errors_for_files(&files(&["src/other.rs"]), 5).unwrap().is_empty());
        assert_index_consistent(&store);
    }

    #[test]
    fn test_record_error_new_fix_replaces_old() {
        let store = store();
        let msg = "connection refused";
        store
            .record_error(&NewError { message: msg.into(), files: vec![], fix: Some("old".into()) })
            .unwrap();
        store
            .record_error(&NewError { message: msg.into(), files: vec![], fix: Some("new".into()) })
            .unwrap();
        assert_eq!(store.top_errors(1).unwrap()[0].fix.as_deref(), Some("new"));
    }

    #[test]
    fn test_add_learning_merges_near_duplicate() {
        let store = store();
        let first = store
            .add_learning(&NewLearning {
                anti_pattern: "calling unwrap on database results inside request handlers".into(),
                correct_pattern: "propagate with ?".into(),
                ..Default::default()
            })
            .unwrap();
        let again = store
            .add_learning(&NewLearning {
                anti_pattern: "calling unwrap on database results inside request handlers".into(),
                correct_pattern: "map the error".into(),
                auto_block: true,
                ..Default::default()
            })
            .unwrap();
        let other = store
            .add_learning(&NewLearning {
                anti_pattern: "spawning threads per connection".into(),
                correct_pattern: "use the runtime".into(),
                ..Default::default()
            })
            .unwrap();

        assert!(first.is_created());
        assert_eq!(again, UpsertOutcome::Merged(first.id()));
        assert!(other.is_created());

        let learnings = store.learnings(10).unwrap();
        assert_eq!(learnings.len(), 2);
        assert_eq!(learnings[0].id, first.id());
        assert_eq!(learnings[0].occurrences, 2);
        assert!(learnings[0].auto_block);
        assert_eq!(store.blocking_learnings().unwrap().len(), 1);
    }

    #[test]
    fn test_check_blocked_patterns() {
        let store = store();
        store
            .add_learning(&NewLearning {
                anti_pattern: "unwrap in production paths".into(),
                correct_pattern: "propagate errors".into(),
                severity: Severity::High,
                auto_block: true,
                detection_pattern: Some(r"\.unwrap\(\)".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .add_learning(&NewLearning {
                anti_pattern: "broken regex learning".into(),
                correct_pattern: "n/a".into(),
                detection_pattern: Some("(unclosed".into()),
                ..Default::default()
            })
            .unwrap();

        let hits = store.check_blocked_patterns("let v = map.get(k).unwrap();").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, Severity::High);
        assert!(store.check_blocked_patterns("let v = map.get(k)?;").unwrap().is_empty());

        let broken = store.search("broken", 5).unwrap();
        assert_eq!(broken.len(), 1);
    }

    #[test]
    fn test_open_unfinished_priority_order() {
        let store = store();
        for (desc, priority) in [
            ("write docs", Severity::Low),
            ("fix flaky test", Severity::High),
            ("tidy imports", Severity::Medium),
        ] {
            store
                .add_unfinished(&NewUnfinished {
                    description: desc.into(),
                    priority,
                    ..Default::default()
                })
                .unwrap();
        }
        let open = store.open_unfinished(10).unwrap();
        let order: Vec<_> = open.iter().map(|u| u.description.as_str()).collect();
        assert_eq!(order, vec!["fix flaky test", "tidy imports", "write docs"]);
    }

    #[test]
    fn test_archive_hides_from_reads_but_keeps_index_row() {
        let store = store();
        let id = store
            .add_decision(&NewDecision {
                title: "Use WAL journal".into(),
                rationale: Some("concurrent readers".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.search("journal", 10).unwrap().len(), 1);

        assert!(store.archive(KnowledgeKind::Decision, id).unwrap());
        assert!(!store.archive(KnowledgeKind::Decision, id).unwrap());
        assert!(store.recent_decisions(10).unwrap().is_empty());
        assert!(store.search("journal", 10).unwrap().is_empty());
        assert_index_consistent(&store);
    }

    #[test]
    fn test_delete_removes_index_row() {
        let store = store();
        let id = store
            .add_unfinished(&NewUnfinished {
                description: "migrate cursor format".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(store.delete(KnowledgeKind::Unfinished, id).unwrap());
        assert!(!store.delete(KnowledgeKind::Unfinished, id).unwrap());
        assert!(store.search("cursor", 10).unwrap().is_empty());
        assert_index_consistent(&store);
    }

    #[test]
    fn test_touch_tracks_access() {
        let store = store();
        let id = store
            .add_decision(&NewDecision { title: "Adopt tracing".into(), ..Default::default() })
            .unwrap();
        store.touch(KnowledgeKind::Decision, &[id]).unwrap();
        store.touch(KnowledgeKind::Decision, &[id]).unwrap();
        let decision = &store.recent_decisions(1).unwrap()[0];
        assert_eq!(decision.lifecycle.access_count, 2);
        assert!(decision.lifecycle.last_accessed.is_some());
    }

    #[test]
    fn test_search_spans_kinds_and_limits() {
        let store = store();
        store
            .add_decision(&NewDecision { title: "Tokio runtime everywhere".into(), ..Default::default() })
            .unwrap();
        store
            .record_error(&NewError { message: "tokio runtime panicked".into(), ..Default::default() })
            .unwrap();
        let hits = store.search("tokio", 10).unwrap();
        assert_eq!(hits.len(), 2);
        let kinds: Vec<_> = hits.iter().map(|h| h.kind).collect();
        assert!(kinds.contains(&KnowledgeKind::Decision));
        assert!(kinds.contains(&KnowledgeKind::Error));
        assert_eq!(store.search("tokio", 1).unwrap().len(), 1);
        assert!(store.search("", 10).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_repairs_drift() {
        let store = store();
        let id = store
            .add_decision(&NewDecision { title: "Index everything".into(), ..Default::default() })
            .unwrap();
        {
            let conn = store.conn();
            conn.execute("DELETE FROM decisions_fts WHERE rowid = ?1", params![id]).unwrap();
            conn.execute(
                "INSERT INTO errors_fts(rowid, message, fix, files) VALUES (999, 'ghost', '', '')",
                [],
            )
            .unwrap();
        }
        let drift = store.verify_index_consistency().unwrap();
        let decisions = drift.iter().find(|d| d.kind == KnowledgeKind::Decision).unwrap();
        let errors = drift.iter().find(|d| d.kind == KnowledgeKind::Error).unwrap();
        assert_eq!(decisions.missing, 1);
        assert_eq!(errors.orphaned, 1);

        assert_eq!(store.rebuild_index().unwrap(), 1);
        assert_index_consistent(&store);
        assert_eq!(store.search("everything", 5).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.db");
        {
            let store = KnowledgeStore::open(&path).unwrap();
            store
                .add_decision(&NewDecision { title: "Persist me".into(), ..Default::default() })
                .unwrap();
        }
        let store = KnowledgeStore::open(&path).unwrap();
        assert_eq!(store.recent_decisions(5).unwrap().len(), 1);
        assert_eq!(store.schema_version().unwrap(), 4);
        assert_index_consistent(&store);
    }
}
