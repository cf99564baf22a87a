//! Relevance scoring and budget selection for the context block
//!
//! Every scorer returns a value in `0..=100`. Selection is greedy: items are taken in score
//! order until the first one that would overflow the token budget.

use crate::types::{
    DecisionRecord, ErrorRecord, KnowledgeKind, LearningRecord, ScoredItem, SessionRecord,
    Severity, UnfinishedRecord,
};
use chrono::{DateTime, Utc};
use std::path::Path;

const MAX_SCORE: u32 = 100;
const OVERLAP_PER_FILE: u32 = 15;
const OVERLAP_CAP: u32 = 45;

/// Section order and headings of the formatted context block
const SECTIONS: &[(KnowledgeKind, &str)] = &[
    (KnowledgeKind::Session, "## Recent Sessions"),
    (KnowledgeKind::Unfinished, "## Unfinished Work"),
    (KnowledgeKind::Error, "## Known Errors"),
    (KnowledgeKind::Learning, "## Blocked Patterns"),
    (KnowledgeKind::Decision, "## Decisions"),
];

/// Age in fractional days of an RFC 3339 timestamp. Unparseable timestamps count as ancient.
pub fn age_days(timestamp: &str, now: DateTime<Utc>) -> f64 {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(ts) => {
            let secs = (now - ts.with_timezone(&Utc)).num_seconds().max(0);
            secs as f64 / 86_400.0
        }
        Err(_) => f64::MAX,
    }
}

/// Recency bucket: +30 under a day, +20 under 3, +10 under 7, +5 under 30
pub fn recency_bonus(days: f64) -> u32 {
    if days < 1.0 {
        30
    } else if days < 3.0 {
        20
    } else if days < 7.0 {
        10
    } else if days < 30.0 {
        5
    } else {
        0
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim().trim_start_matches("./")
}

/// Number of `files` that are part of the working set
fn overlap_count(files: &[String], working_set: &[String]) -> u32 {
    files
        .iter()
        .filter(|f| {
            let f = normalize_path(f);
            working_set.iter().any(|w| normalize_path(w) == f)
        })
        .count() as u32
}

fn overlap_bonus(files: &[String], working_set: &[String]) -> u32 {
    (OVERLAP_PER_FILE * overlap_count(files, working_set)).min(OVERLAP_CAP)
}

pub fn score_session(session: &SessionRecord, working_set: &[String], now: DateTime<Utc>) -> u32 {
    let recency = recency_bonus(age_days(&session.ended_at, now));
    let overlap = overlap_bonus(&session.files_touched, working_set);
    let mentioned = working_set
        .iter()
        .filter_map(|f| Path::new(normalize_path(f)).file_name())
        .filter_map(|name| name.to_str())
        .filter(|name| session.summary.contains(name))
        .count() as u32;
    (recency + overlap + 10 * mentioned).min(MAX_SCORE)
}

pub fn score_error(error: &ErrorRecord, working_set: &[String]) -> u32 {
    let overlap = if overlap_count(&error.files, working_set) > 0 { 40 } else { 0 };
    let frequency = if error.occurrences > 5 {
        20
    } else if error.occurrences > 2 {
        15
    } else {
        5
    };
    let fix = if error.fix.as_deref().is_some_and(|f| !f.trim().is_empty()) {
        10
    } else {
        0
    };
    (overlap + frequency + fix).min(MAX_SCORE)
}

pub fn score_learning(learning: &LearningRecord) -> u32 {
    let block = if learning.auto_block { 30 } else { 0 };
    let severity = match learning.severity {
        Severity::High => 20,
        Severity::Medium => 10,
        Severity::Low => 0,
    };
    let occurrences = (5 * learning.occurrences.max(0)).min(20) as u32;
    (block + severity + occurrences).min(MAX_SCORE)
}

pub fn score_decision(decision: &DecisionRecord, working_set: &[String], now: DateTime<Utc>) -> u32 {
    let recency = recency_bonus(age_days(&decision.created_at, now));
    (recency + overlap_bonus(&decision.files, working_set)).min(MAX_SCORE)
}

pub fn score_unfinished(item: &UnfinishedRecord, working_set: &[String]) -> u32 {
    let priority = match item.priority {
        Severity::High => 50,
        Severity::Medium => 35,
        Severity::Low => 20,
    };
    (priority + overlap_bonus(&item.files, working_set)).min(MAX_SCORE)
}

/// Rough token count: one token per four characters, rounded up
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count().div_ceil(4)
}

/// Sort by score (stable, descending) and take items while the running token estimate fits.
/// Stops at the first item that would overflow, even if a later smaller one would fit.
pub fn select_within_budget(mut items: Vec<ScoredItem>, max_tokens: usize) -> Vec<ScoredItem> {
    items.sort_by(|a, b| b.score.cmp(&a.score));
    let mut used = 0usize;
    let mut selected = Vec::new();
    for item in items {
        let cost = estimate_tokens(&item.content);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        selected.push(item);
    }
    selected
}

/// Render selected items as labeled sections in fixed order.
/// Learnings appear only when flagged auto-block; empty sections are omitted.
pub fn format_context(selected: &[ScoredItem]) -> String {
    let mut sections: Vec<String> = Vec::new();
    for (kind, heading) in SECTIONS {
        let lines: Vec<String> = selected
            .iter()
            .filter(|item| item.kind == *kind)
            .filter(|item| item.kind != KnowledgeKind::Learning || item.flagged)
            .map(|item| format!("- {}", item.content))
            .collect();
        if lines.is_empty() {
            continue;
        }
        sections.push(format!("{}\n{}", heading, lines.join("\n")));
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lifecycle;
    use chrono::Duration;

    fn session(ended_at: DateTime<Utc>, files: &[&str], summary: &str) -> SessionRecord {
        SessionRecord {
            id: 1,
            session_id: "s1".into(),
            summary: summary.into(),
            files_touched: files.iter().map(|f| f.to_string()).collect(),
            branch: None,
            started_at: None,
            ended_at: ended_at.to_rfc3339(),
            lifecycle: Lifecycle::default(),
        }
    }

    fn item(kind: KnowledgeKind, id: i64, score: u32, len: usize) -> ScoredItem {
        ScoredItem {
            kind,
            content: "x".repeat(len),
            score,
            id,
            flagged: false,
        }
    }

    fn ws(files: &[&str]) -> Vec<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_recent_session_without_overlap_scores_30() {
        let now = Utc::now();
        let s = session(now - Duration::hours(12), &["src/other.rs"], "worked on parser");
        assert_eq!(score_session(&s, &ws(&["src/main.rs"]), now), 30);
    }

    #[test]
    fn test_session_overlap_caps_at_45() {
        let now = Utc::now();
        let files = ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"];
        let s = session(now - Duration::days(40), &files, "summary");
        assert_eq!(score_session(&s, &ws(&files[..3]), now), 45);
        assert_eq!(score_session(&s, &ws(&files), now), 45);
    }

    #[test]
    fn test_session_basename_mention() {
        let now = Utc::now();
        let s = session(now - Duration::days(2), &[], "refactored queue.rs and db/mod.rs");
        // 20 recency + 10 for queue.rs + 10 for mod.rs
        assert_eq!(
            score_session(&s, &ws(&["crates/core/src/queue.rs", "./src/db/mod.rs"]), now),
            40
        );
    }

    #[test]
    fn test_session_score_capped_at_100() {
        let now = Utc::now();
        let files = ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs"];
        let s = session(now, &files, "a.rs b.rs c.rs d.rs e.rs f.rs");
        assert_eq!(score_session(&s, &ws(&files), now), 100);
    }

    #[test]
    fn test_recency_buckets() {
        assert_eq!(recency_bonus(0.2), 30);
        assert_eq!(recency_bonus(2.9), 20);
        assert_eq!(recency_bonus(6.0), 10);
        assert_eq!(recency_bonus(29.0), 5);
        assert_eq!(recency_bonus(30.0), 0);
        assert_eq!(age_days("not a date", Utc::now()), f64::MAX);
    }

    #[test]
    fn test_error_score() {
        let mut error = ErrorRecord {
            id: 1,
            signature: "sig".into(),
            message: "boom".into(),
            files: vec!["src/a.rs".into()],
            fix: None,
            occurrences: 1,
            first_seen: String::new(),
            last_seen: String::new(),
            lifecycle: Lifecycle::default(),
        };
        assert_eq!(score_error(&error, &ws(&["src/b.rs"])), 5);
        assert_eq!(score_error(&error, &ws(&["src/a.rs"])), 45);
        error.occurrences = 3;
        error.fix = Some("restart".into());
        assert_eq!(score_error(&error, &ws(&["src/a.rs"])), 65);
        error.occurrences = 6;
        assert_eq!(score_error(&error, &ws(&["src/a.rs"])), 70);
    }

    #[test]
    fn test_learning_score() {
        let mut learning = LearningRecord {
            id: 1,
            anti_pattern: "a".into(),
            correct_pattern: "b".into(),
            context: None,
            severity: Severity::Low,
            auto_block: false,
            detection_pattern: None,
            occurrences: 1,
            created_at: String::new(),
            updated_at: String::new(),
            lifecycle: Lifecycle::default(),
        };
        assert_eq!(score_learning(&learning), 5);
        learning.auto_block = true;
        learning.severity = Severity::High;
        learning.occurrences = 10;
        assert_eq!(score_learning(&learning), 70);
    }

    #[test]
    fn test_unfinished_score() {
        let item = UnfinishedRecord {
            id: 1,
            session_id: None,
            description: "wire up retries".into(),
            priority: Severity::High,
            files: vec!["a.rs".into()],
            created_at: String::new(),
            lifecycle: Lifecycle::default(),
        };
        assert_eq!(score_unfinished(&item, &ws(&[])), 50);
        assert_eq!(score_unfinished(&item, &ws(&["a.rs"])), 65);
    }

    #[test]
    fn test_greedy_budget_takes_highest_only() {
        let items = vec![
            item(KnowledgeKind::Error, 1, 50, 40),
            item(KnowledgeKind::Error, 2, 90, 40),
            item(KnowledgeKind::Error, 3, 70, 40),
        ];
        let selected = select_within_budget(items, 15);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }

    #[test]
    fn test_greedy_stops_at_first_overflow() {
        let items = vec![
            item(KnowledgeKind::Error, 1, 90, 40), // 10 tokens
            item(KnowledgeKind::Error, 2, 80, 80), // 20 tokens: overflows
            item(KnowledgeKind::Error, 3, 70, 4),  // 1 token: never considered
        ];
        let selected = select_within_budget(items, 25);
        assert_eq!(selected.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_format_sections_in_order() {
        let mut learning_flagged = item(KnowledgeKind::Learning, 4, 10, 0);
        learning_flagged.content = "never block the runtime".into();
        learning_flagged.flagged = true;
        let mut learning_plain = item(KnowledgeKind::Learning, 5, 10, 0);
        learning_plain.content = "style nit".into();
        let mut decision = item(KnowledgeKind::Decision, 6, 10, 0);
        decision.content = "use sqlite".into();
        let mut session_item = item(KnowledgeKind::Session, 7, 10, 0);
        session_item.content = "fixed queue".into();

        let text = format_context(&[decision, learning_plain, learning_flagged, session_item]);
        assert_eq!(
            text,
            "## Recent Sessions\n- fixed queue\n\n## Blocked Patterns\n- never block the runtime\n\n## Decisions\n- use sqlite"
        );
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_context(&[]), "");
    }
}
