//! Diff, dependency, agent-run and health bookkeeping

use super::{from_json, now, to_json, KnowledgeStore};
use crate::types::{
    AgentRunRecord, ChangeType, DependencyRecord, DiffRecord, HealthSnapshot, ParsedDiff,
    StoreStats,
};
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};

/// Longest error message kept on an agent run
pub const MAX_RUN_ERROR_CHARS: usize = 500;

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

impl KnowledgeStore {
    // ============ Diffs ============

    pub fn record_diff(
        &self,
        session_id: Option<&str>,
        diff: &ParsedDiff,
        functions: &[String],
    ) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO diffs (session_id, file_path, change_type, lines_added, lines_removed, functions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                diff.file_path,
                diff.change_type.as_str(),
                diff.lines_added,
                diff.lines_removed,
                to_json(functions),
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn diffs_for_file(&self, file_path: &str, limit: usize) -> SqliteResult<Vec<DiffRecord>> {
        self.query_list(
            "SELECT * FROM diffs WHERE file_path = ?1 ORDER BY id DESC LIMIT ?2",
            params![file_path, limit as i64],
            Self::row_to_diff,
        )
    }

    fn row_to_diff(row: &Row) -> SqliteResult<DiffRecord> {
        let change_type: String = row.get("change_type")?;
        Ok(DiffRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            file_path: row.get("file_path")?,
            change_type: ChangeType::from_str(&change_type).unwrap_or(ChangeType::Modified),
            lines_added: row.get("lines_added")?,
            lines_removed: row.get("lines_removed")?,
            functions: from_json(row.get("functions")?),
            created_at: row.get("created_at")?,
        })
    }

    // ============ Dependencies ============

    /// Note that `file_path` imports `name`; repeats bump the occurrence count
    pub fn record_dependency(&self, file_path: &str, name: &str) -> SqliteResult<()> {
        let ts = now();
        self.conn().execute(
            "INSERT INTO dependencies (file_path, name, occurrences, first_seen, last_seen)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(file_path, name) DO UPDATE SET
               occurrences = occurrences + 1,
               last_seen = excluded.last_seen",
            params![file_path, name, ts],
        )?;
        Ok(())
    }

    pub fn dependencies_for(&self, file_path: &str) -> SqliteResult<Vec<DependencyRecord>> {
        self.query_list(
            "SELECT * FROM dependencies WHERE file_path = ?1 ORDER BY occurrences DESC, name",
            params![file_path],
            |row| {
                Ok(DependencyRecord {
                    id: row.get("id")?,
                    file_path: row.get("file_path")?,
                    name: row.get("name")?,
                    occurrences: row.get("occurrences")?,
                    first_seen: row.get("first_seen")?,
                    last_seen: row.get("last_seen")?,
                })
            },
        )
    }

    // ============ Agent runs ============

    /// Open a pending run. Returns its id.
    pub fn start_run(&self, agent_name: &str, session_id: Option<&str>) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agent_runs (agent_name, session_id, started_at) VALUES (?1, ?2, ?3)",
            params![agent_name, session_id, epoch_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close a pending run. Duration comes from the stored start time.
    ///
    /// Returns false if the run does not exist or was already closed.
    pub fn finish_run(&self, run_id: i64, success: bool, error: Option<&str>) -> SqliteResult<bool> {
        let error = error.map(|e| truncate_chars(e, MAX_RUN_ERROR_CHARS));
        let changed = self.conn().execute(
            "UPDATE agent_runs SET finished_at = ?2, success = ?3, error_message = ?4,
               duration_ms = MAX(?2 - started_at, 0)
             WHERE id = ?1 AND finished_at IS NULL",
            params![run_id, epoch_ms(), success, error],
        )?;
        Ok(changed > 0)
    }

    pub fn set_items_saved(&self, run_id: i64, items: i64) -> SqliteResult<()> {
        self.conn().execute(
            "UPDATE agent_runs SET items_saved = ?2 WHERE id = ?1",
            params![run_id, items],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> SqliteResult<Option<AgentRunRecord>> {
        self.conn()
            .query_row(
                "SELECT * FROM agent_runs WHERE id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()
    }

    pub fn recent_runs(&self, limit: usize) -> SqliteResult<Vec<AgentRunRecord>> {
        self.query_list(
            "SELECT * FROM agent_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
            params![limit as i64],
            Self::row_to_run,
        )
    }

    /// (total, failed) runs started at or after `since_ms`
    pub fn run_counts_since(&self, since_ms: i64) -> SqliteResult<(i64, i64)> {
        self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0)
             FROM agent_runs WHERE started_at >= ?1",
            params![since_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    fn row_to_run(row: &Row) -> SqliteResult<AgentRunRecord> {
        Ok(AgentRunRecord {
            id: row.get("id")?,
            agent_name: row.get("agent_name")?,
            session_id: row.get("session_id")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            success: row.get::<_, Option<i64>>("success")?.map(|v| v != 0),
            error_message: row.get("error_message")?,
            duration_ms: row.get("duration_ms")?,
            items_saved: row.get("items_saved")?,
        })
    }

    // ============ Health ============

    pub fn record_health(&self, snapshot: &HealthSnapshot) -> SqliteResult<()> {
        let taken_at = if snapshot.taken_at.is_empty() {
            now()
        } else {
            snapshot.taken_at.clone()
        };
        self.conn().execute(
            "INSERT INTO health_snapshots (taken_at, pending_events, runner_queue_depth,
               runs_last_hour, failed_runs_last_hour, live_records)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                taken_at,
                snapshot.pending_events,
                snapshot.runner_queue_depth,
                snapshot.runs_last_hour,
                snapshot.failed_runs_last_hour,
                snapshot.live_records,
            ],
        )?;
        Ok(())
    }

    pub fn latest_health(&self) -> SqliteResult<Option<HealthSnapshot>> {
        self.conn()
            .query_row(
                "SELECT * FROM health_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(HealthSnapshot {
                        taken_at: row.get("taken_at")?,
                        pending_events: row.get("pending_events")?,
                        runner_queue_depth: row.get("runner_queue_depth")?,
                        runs_last_hour: row.get("runs_last_hour")?,
                        failed_runs_last_hour: row.get("failed_runs_last_hour")?,
                        live_records: row.get("live_records")?,
                    })
                },
            )
            .optional()
    }

    // ============ Stats ============

    pub fn stats(&self) -> SqliteResult<StoreStats> {
        let conn = self.conn();
        let count = |sql: &str| -> SqliteResult<i64> { conn.query_row(sql, [], |row| row.get(0)) };
        Ok(StoreStats {
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            decisions: count("SELECT COUNT(*) FROM decisions")?,
            errors: count("SELECT COUNT(*) FROM errors")?,
            learnings: count("SELECT COUNT(*) FROM learnings")?,
            unfinished: count("SELECT COUNT(*) FROM unfinished")?,
            archived: count(
                "SELECT (SELECT COUNT(*) FROM sessions WHERE archived_at IS NOT NULL)
                      + (SELECT COUNT(*) FROM decisions WHERE archived_at IS NOT NULL)
                      + (SELECT COUNT(*) FROM errors WHERE archived_at IS NOT NULL)
                      + (SELECT COUNT(*) FROM learnings WHERE archived_at IS NOT NULL)
                      + (SELECT COUNT(*) FROM unfinished WHERE archived_at IS NOT NULL)",
            )?,
            diffs: count("SELECT COUNT(*) FROM diffs")?,
            dependencies: count("SELECT COUNT(*) FROM dependencies")?,
            agent_runs: count("SELECT COUNT(*) FROM agent_runs")?,
        })
    }
}
