//! Context block assembly
//!
//! Loads live knowledge, scores it against the caller's working set and renders the
//! highest-scoring items that fit the token budget.

use crate::db::KnowledgeStore;
use crate::scoring::{
    format_context, score_decision, score_error, score_learning, score_session, score_unfinished,
    select_within_budget,
};
use crate::types::{
    DecisionRecord, ErrorRecord, KnowledgeKind, LearningRecord, ScoredItem, SessionRecord,
    UnfinishedRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::Result as SqliteResult;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TOKENS: usize = 2000;

/// How many live records of each kind are considered per build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLimits {
    pub sessions: usize,
    pub decisions: usize,
    pub errors: usize,
    pub learnings: usize,
    pub unfinished: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            sessions: 10,
            decisions: 20,
            errors: 20,
            learnings: 30,
            unfinished: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub working_set: Vec<String>,
    pub max_tokens: usize,
    /// Scoring clock; `None` means now
    pub now: Option<DateTime<Utc>>,
}

impl ContextRequest {
    pub fn new(working_set: Vec<String>) -> Self {
        Self {
            working_set,
            max_tokens: DEFAULT_MAX_TOKENS,
            now: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBlock {
    pub text: String,
    pub items: Vec<ScoredItem>,
    /// Records scored before the budget cut
    pub considered: usize,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

fn session_content(s: &SessionRecord) -> String {
    let date = s.ended_at.get(..10).unwrap_or(&s.ended_at);
    let mut content = match &s.branch {
        Some(branch) => format!("{} [{}] {}", date, branch, s.summary),
        None => format!("{} {}", date, s.summary),
    };
    if !s.files_touched.is_empty() {
        content.push_str(&format!(" (files: {})", s.files_touched.join(", ")));
    }
    content
}

fn error_content(e: &ErrorRecord) -> String {
    let mut content = format!("{} (seen {}x)", e.message, e.occurrences);
    if let Some(fix) = &e.fix {
        content.push_str(&format!(" | fix: {}", fix));
    }
    content
}

fn learning_content(l: &LearningRecord) -> String {
    format!("Avoid: {} -> Instead: {}", l.anti_pattern, l.correct_pattern)
}

fn decision_content(d: &DecisionRecord) -> String {
    match &d.rationale {
        Some(rationale) => format!("{}: {}", d.title, rationale),
        None => d.title.clone(),
    }
}

fn unfinished_content(u: &UnfinishedRecord) -> String {
    format!("[{}] {}", u.priority.as_str(), u.description)
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    limits: ContextLimits,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    /// Score live knowledge against the request and render what fits.
    ///
    /// Selected records get their access stats bumped.
    pub fn build(&self, store: &KnowledgeStore, request: &ContextRequest) -> SqliteResult<ContextBlock> {
        let now = request.now.unwrap_or_else(Utc::now);
        let ws = &request.working_set;
        let mut candidates: Vec<ScoredItem> = Vec::new();

        for s in store.recent_sessions(self.limits.sessions)? {
            candidates.push(ScoredItem {
                kind: KnowledgeKind::Session,
                content: session_content(&s),
                score: score_session(&s, ws, now),
                id: s.id,
                flagged: false,
            });
        }
        for u in store.open_unfinished(self.limits.unfinished)? {
            candidates.push(ScoredItem {
                kind: KnowledgeKind::Unfinished,
                content: unfinished_content(&u),
                score: score_unfinished(&u, ws),
                id: u.id,
                flagged: false,
            });
        }
        for e in store.top_errors(self.limits.errors)? {
            candidates.push(ScoredItem {
                kind: KnowledgeKind::Error,
                content: error_content(&e),
                score: score_error(&e, ws),
                id: e.id,
                flagged: false,
            });
        }
        // unflagged learnings are never rendered
        for l in store.learnings(self.limits.learnings)?.into_iter().filter(|l| l.auto_block) {
            candidates.push(ScoredItem {
                kind: KnowledgeKind::Learning,
                content: learning_content(&l),
                score: score_learning(&l),
                id: l.id,
                flagged: l.auto_block,
            });
        }
        for d in store.recent_decisions(self.limits.decisions)? {
            candidates.push(ScoredItem {
                kind: KnowledgeKind::Decision,
                content: decision_content(&d),
                score: score_decision(&d, ws, now),
                id: d.id,
                flagged: false,
            });
        }

        let considered = candidates.len();
        let items = select_within_budget(candidates, request.max_tokens);
        let text = format_context(&items);

        for kind in KnowledgeKind::ALL {
            let ids: Vec<i64> = items.iter().filter(|i| i.kind == kind).map(|i| i.id).collect();
            store.touch(kind, &ids)?;
        }

        tracing::debug!(considered, selected = items.len(), "Built context block");
        Ok(ContextBlock {
            text,
            items,
            considered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewDecision, NewError, NewLearning, NewSession, NewUnfinished, Severity};

    fn seeded() -> KnowledgeStore {
        let store = KnowledgeStore::in_memory().unwrap();
        store
            .upsert_session(&NewSession {
                session_id: "s1".into(),
                summary: "reworked queue.rs cursor handling".into(),
                files_touched: vec!["src/queue.rs".into()],
                branch: Some("main".into()),
                started_at: None,
            })
            .unwrap();
        store
            .add_unfinished(&NewUnfinished {
                description: "handle cursor corruption".into(),
                priority: Severity::High,
                files: vec!["src/queue.rs".into()],
                ..Default::default()
            })
            .unwrap();
        store
            .record_error(&NewError {
                message: "cursor file missing".into(),
                files: vec!["src/queue.rs".into()],
                fix: Some("default the cursor".into()),
            })
            .unwrap();
        store
            .add_learning(&NewLearning {
                anti_pattern: "blocking file io in async tasks".into(),
                correct_pattern: "use tokio::fs".into(),
                auto_block: true,
                ..Default::default()
            })
            .unwrap();
        store
            .add_learning(&NewLearning {
                anti_pattern: "long functions".into(),
                correct_pattern: "split them".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .add_decision(&NewDecision {
                title: "Persist a line cursor".into(),
                rationale: Some("survives restarts".into()),
                files: vec!["src/queue.rs".into()],
                ..Default::default()
            })
            .unwrap();
        store
    }

    #[test]
    fn test_build_renders_all_sections_in_order() {
        let store = seeded();
        let request = ContextRequest::new(vec!["src/queue.rs".into()]);
        let block = ContextBuilder::default().build(&store, &request).unwrap();

        assert_eq!(block.considered, 5);
        assert_eq!(block.items.len(), 5);
        let headings: Vec<&str> = block.text.lines().filter(|l| l.starts_with("## ")).collect();
        assert_eq!(
            headings,
            vec![
                "## Recent Sessions",
                "## Unfinished Work",
                "## Known Errors",
                "## Blocked Patterns",
                "## Decisions"
            ]
        );
        assert!(block.text.contains("- [high] handle cursor corruption"));
        assert!(block.text.contains("| fix: default the cursor"));
        assert!(!block.text.contains("long functions"));
    }

    #[test]
    fn test_build_respects_budget_and_touches_selected() {
        let store = seeded();
        let request = ContextRequest {
            working_set: vec!["src/queue.rs".into()],
            max_tokens: 20,
            now: None,
        };
        let block = ContextBuilder::default().build(&store, &request).unwrap();
        // unfinished (50 + 15) wins; the 55-point session would overflow the budget
        assert_eq!(block.items.len(), 1);
        assert_eq!(block.items[0].kind, KnowledgeKind::Unfinished);
        assert_eq!(block.items[0].score, 65);

        let unfinished = &store.open_unfinished(1).unwrap()[0];
        assert_eq!(unfinished.lifecycle.access_count, 1);
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.lifecycle.access_count, 0);
    }

    #[test]
    fn test_empty_store_builds_empty_block() {
        let store = KnowledgeStore::in_memory().unwrap();
        let block = ContextBuilder::default()
            .build(&store, &ContextRequest::new(vec![]))
            .unwrap();
        assert!(block.is_empty());
        assert_eq!(block.considered, 0);
    }
}
