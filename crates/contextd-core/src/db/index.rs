//! FTS5 shadow index
//!
//! Every knowledge table has an FTS5 twin whose rowid equals the
//! base row id. The index is written explicitly inside the same transaction as the base
//! row, never through triggers.

use crate::types::{KnowledgeKind, SearchHit};
use rusqlite::{params, Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};

pub(crate) struct IndexedTable {
    pub kind: KnowledgeKind,
    pub table: &'static str,
    pub fts: &'static str,
    pub columns: &'static [&'static str],
}

pub(crate) const INDEXED: &[IndexedTable] = &[
    IndexedTable {
        kind: KnowledgeKind::Session,
        table: "sessions",
        fts: "sessions_fts",
        columns: &["summary", "files_touched", "branch"],
    },
    IndexedTable {
        kind: KnowledgeKind::Decision,
        table: "decisions",
        fts: "decisions_fts",
        columns: &["title", "rationale", "files"],
    },
    IndexedTable {
        kind: KnowledgeKind::Error,
        table: "errors",
        fts: "errors_fts",
        columns: &["message", "fix", "files"],
    },
    IndexedTable {
        kind: KnowledgeKind::Learning,
        table: "learnings",
        fts: "learnings_fts",
        columns: &["anti_pattern", "correct_pattern", "context"],
    },
    IndexedTable {
        kind: KnowledgeKind::Unfinished,
        table: "unfinished",
        fts: "unfinished_fts",
        columns: &["description", "files"],
    },
];

pub(crate) fn table_for(kind: KnowledgeKind) -> &'static IndexedTable {
    match kind {
        KnowledgeKind::Session => &INDEXED[0],
        KnowledgeKind::Decision => &INDEXED[1],
        KnowledgeKind::Error => &INDEXED[2],
        KnowledgeKind::Learning => &INDEXED[3],
        KnowledgeKind::Unfinished => &INDEXED[4],
    }
}

impl IndexedTable {
    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("COALESCE({}, '')", c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {fts}(rowid, {cols}) SELECT id, {select} FROM {table}",
            fts = self.fts,
            cols = self.columns.join(", "),
            select = self.select_list(),
            table = self.table,
        )
    }
}

/// Drift between one base table and its index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDrift {
    pub kind: KnowledgeKind,
    /// Base rows with no index row
    pub missing: i64,
    /// Index rows with no base row
    pub orphaned: i64,
}

impl IndexDrift {
    pub fn is_consistent(&self) -> bool {
        self.missing == 0 && self.orphaned == 0
    }
}

pub(crate) fn create_tables(conn: &Connection) -> SqliteResult<()> {
    for def in INDEXED {
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5({});",
            def.fts,
            def.columns.join(", ")
        ))?;
    }
    Ok(())
}

/// Replace the index row for `id` with the base row's current content.
/// Call inside the transaction that wrote the base row.
pub(crate) fn sync_row(conn: &Connection, kind: KnowledgeKind, id: i64) -> SqliteResult<()> {
    let def = table_for(kind);
    remove_row(conn, kind, id)?;
    conn.execute(&format!("{} WHERE id = ?1", def.insert_sql()), params![id])?;
    Ok(())
}

pub(crate) fn remove_row(conn: &Connection, kind: KnowledgeKind, id: i64) -> SqliteResult<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE rowid = ?1", table_for(kind).fts),
        params![id],
    )?;
    Ok(())
}

pub(crate) fn drift(conn: &Connection) -> SqliteResult<Vec<IndexDrift>> {
    let mut report = Vec::with_capacity(INDEXED.len());
    for def in INDEXED {
        let missing: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE id NOT IN (SELECT rowid FROM {})",
                def.table, def.fts
            ),
            [],
            |row| row.get(0),
        )?;
        let orphaned: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE rowid NOT IN (SELECT id FROM {})",
                def.fts, def.table
            ),
            [],
            |row| row.get(0),
        )?;
        report.push(IndexDrift {
            kind: def.kind,
            missing,
            orphaned,
        });
    }
    Ok(report)
}

/// Drop and repopulate every index table from its base table
pub(crate) fn rebuild(conn: &Connection) -> SqliteResult<usize> {
    let mut indexed = 0;
    for def in INDEXED {
        conn.execute(&format!("DELETE FROM {}", def.fts), [])?;
        indexed += conn.execute(&def.insert_sql(), [])?;
    }
    Ok(indexed)
}

/// Quote each whitespace-separated word so user input can't inject FTS syntax
pub(crate) fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Search every index, keeping only live (non-archived) base rows
pub(crate) fn search(conn: &Connection, query: &str, limit: usize) -> SqliteResult<Vec<SearchHit>> {
    let fts_query = fts_query(query);
    if fts_query.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut hits = Vec::new();
    for def in INDEXED {
        let mut stmt = conn.prepare(&format!(
            "SELECT {fts}.rowid, snippet({fts}, -1, '[', ']', '...', 12), bm25({fts})
             FROM {fts} JOIN {table} b ON b.id = {fts}.rowid
             WHERE {fts} MATCH ?1 AND b.archived_at IS NULL
             ORDER BY bm25({fts}) LIMIT ?2",
            fts = def.fts,
            table = def.table,
        ))?;
        let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
            Ok(SearchHit {
                kind: def.kind,
                id: row.get(0)?,
                snippet: row.get(1)?,
                rank: row.get(2)?,
            })
        })?;
        for hit in rows {
            hits.push(hit?);
        }
    }

    // bm25: lower is better
    hits.sort_by(|a, b| a.rank.partial_cmp(&b.rank).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("parse \"diff\" hunks"), "\"parse\" OR \"diff\" OR \"hunks\"");
        assert_eq!(fts_query("   "), "");
        assert_eq!(fts_query("\"\""), "");
    }

    #[test]
    fn test_table_for_matches_kind() {
        for kind in KnowledgeKind::ALL {
            assert_eq!(table_for(kind).kind, kind);
        }
    }
}
