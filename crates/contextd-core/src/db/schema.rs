//! Schema definition and additive migrations

use rusqlite::{params, Connection, Result as SqliteResult};

pub(crate) const SCHEMA: &str = r#"
-- Schema version log
CREATE TABLE IF NOT EXISTS schema_version (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

-- Sessions
CREATE TABLE IF NOT EXISTS sessions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL UNIQUE,
  summary TEXT NOT NULL,
  files_touched TEXT NOT NULL DEFAULT '[]',
  branch TEXT,
  started_at TEXT,
  ended_at TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  last_accessed TEXT,
  archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);

-- Decisions
CREATE TABLE IF NOT EXISTS decisions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT,
  title TEXT NOT NULL,
  rationale TEXT,
  files TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  last_accessed TEXT,
  archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_decisions_created ON decisions(created_at);

-- Errors (deduplicated by signature)
CREATE TABLE IF NOT EXISTS errors (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  signature TEXT NOT NULL UNIQUE,
  message TEXT NOT NULL,
  files TEXT NOT NULL DEFAULT '[]',
  fix TEXT,
  occurrences INTEGER NOT NULL DEFAULT 1,
  first_seen TEXT NOT NULL,
  last_seen TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  last_accessed TEXT,
  archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_errors_last_seen ON errors(last_seen);

-- Learnings (anti-pattern / correct-pattern pairs)
CREATE TABLE IF NOT EXISTS learnings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  anti_pattern TEXT NOT NULL,
  correct_pattern TEXT NOT NULL,
  context TEXT,
  severity TEXT NOT NULL DEFAULT 'medium',
  auto_block INTEGER NOT NULL DEFAULT 0,
  detection_pattern TEXT,
  occurrences INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  last_accessed TEXT,
  archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_learnings_block ON learnings(auto_block);

-- Unfinished work
CREATE TABLE IF NOT EXISTS unfinished (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT,
  description TEXT NOT NULL,
  priority TEXT NOT NULL DEFAULT 'medium',
  files TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  last_accessed TEXT,
  archived_at TEXT
);

-- Per-file diff summaries
CREATE TABLE IF NOT EXISTS diffs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT,
  file_path TEXT NOT NULL,
  change_type TEXT NOT NULL,
  lines_added INTEGER NOT NULL DEFAULT 0,
  lines_removed INTEGER NOT NULL DEFAULT 0,
  functions TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_diffs_file ON diffs(file_path);

-- Dependencies seen in imports
CREATE TABLE IF NOT EXISTS dependencies (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_path TEXT NOT NULL,
  name TEXT NOT NULL,
  occurrences INTEGER NOT NULL DEFAULT 1,
  first_seen TEXT NOT NULL,
  last_seen TEXT NOT NULL,
  UNIQUE(file_path, name)
);

-- External analysis audit log. success: NULL = pending, 1 = ok, 0 = failed
CREATE TABLE IF NOT EXISTS agent_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent_name TEXT NOT NULL,
  session_id TEXT,
  started_at INTEGER NOT NULL,
  finished_at INTEGER,
  success INTEGER,
  error_message TEXT,
  duration_ms INTEGER,
  items_saved INTEGER
);
CREATE INDEX IF NOT EXISTS idx_agent_runs_started ON agent_runs(started_at);

-- Daemon health samples
CREATE TABLE IF NOT EXISTS health_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  taken_at TEXT NOT NULL,
  pending_events INTEGER NOT NULL DEFAULT 0,
  runner_queue_depth INTEGER NOT NULL DEFAULT 0,
  runs_last_hour INTEGER NOT NULL DEFAULT 0,
  failed_runs_last_hour INTEGER NOT NULL DEFAULT 0,
  live_records INTEGER NOT NULL DEFAULT 0
);
"#;

/// Version written for a database created from [`SCHEMA`]
const BASE_VERSION: i64 = 1;

struct Migration {
    version: i64,
    description: &'static str,
    apply: fn(&Connection) -> SqliteResult<()>,
}

/// Additive migrations for databases created by earlier builds.
/// Each step must be safe to re-run against a database that already has it.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "sessions.branch",
        apply: migrate_session_branch,
    },
    Migration {
        version: 3,
        description: "learnings.detection_pattern",
        apply: migrate_detection_pattern,
    },
    Migration {
        version: 4,
        description: "agent_runs.items_saved",
        apply: migrate_items_saved,
    },
];

fn table_columns(conn: &Connection, table: &str) -> SqliteResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(columns)
}

/// `ALTER TABLE … ADD COLUMN` unless the column already exists
fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> SqliteResult<bool> {
    if table_columns(conn, table)?.iter().any(|c| c == column) {
        return Ok(false);
    }
    conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, decl))?;
    Ok(true)
}

fn migrate_session_branch(conn: &Connection) -> SqliteResult<()> {
    add_column(conn, "sessions", "branch", "TEXT").map(|_| ())
}

fn migrate_detection_pattern(conn: &Connection) -> SqliteResult<()> {
    add_column(conn, "learnings", "detection_pattern", "TEXT").map(|_| ())
}

fn migrate_items_saved(conn: &Connection) -> SqliteResult<()> {
    add_column(conn, "agent_runs", "items_saved", "INTEGER").map(|_| ())
}

pub(crate) fn current_version(conn: &Connection) -> SqliteResult<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Apply every migration newer than the recorded version
pub(crate) fn migrate(conn: &Connection) -> SqliteResult<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    if current_version(conn)? == 0 {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![BASE_VERSION, now],
        )?;
    }

    let start_version = current_version(conn)?;
    let mut version = start_version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > start_version) {
        (migration.apply)(conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, now],
        )?;
        version = migration.version;
        tracing::info!(version, migration = migration.description, "Applied schema migration");
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        let first = migrate(&conn).unwrap();
        let second = migrate(&conn).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, MIGRATIONS.last().map(|m| m.version).unwrap());
    }

    #[test]
    fn test_migrate_adds_missing_column_to_old_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);
             INSERT INTO schema_version VALUES (1, 'then');
             CREATE TABLE sessions (id INTEGER PRIMARY KEY, session_id TEXT, summary TEXT, files_touched TEXT, ended_at TEXT);
             CREATE TABLE learnings (id INTEGER PRIMARY KEY, anti_pattern TEXT);
             CREATE TABLE agent_runs (id INTEGER PRIMARY KEY, agent_name TEXT);",
        )
        .unwrap();
        migrate(&conn).unwrap();
        assert!(table_columns(&conn, "sessions").unwrap().contains(&"branch".to_string()));
        assert!(table_columns(&conn, "learnings")
            .unwrap()
            .contains(&"detection_pattern".to_string()));
        assert!(table_columns(&conn, "agent_runs")
            .unwrap()
            .contains(&"items_saved".to_string()));
    }

    #[test]
    fn test_add_column_tolerates_existing() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        assert!(!add_column(&conn, "sessions", "branch", "TEXT").unwrap());
    }
}
