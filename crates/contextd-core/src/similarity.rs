//! TF-IDF cosine similarity for near-duplicate detection
//!
//! Stateless: every call builds vectors for the query and the supplied corpus only.

use std::collections::{HashMap, HashSet};

/// Score above which two knowledge entries are treated as the same thing
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// English function words that carry no topical signal
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "been", "have",
    "has", "had", "not", "but", "you", "your", "our", "its", "into", "when", "then", "than",
    "also", "will", "would", "should", "could", "can", "all", "any", "there", "their", "they",
    "them", "what", "which", "who", "how", "why", "where", "about", "after", "before", "over",
    "under", "just", "only", "some", "such", "very", "more", "most", "other", "these", "those",
    "because", "while", "being", "does", "did", "doing",
];

/// Chinese particles and pronouns. Chinese text is not space-separated, so these split a run
/// into tokens instead of being matched as whole tokens.
const CJK_PARTICLES: &[char] = &[
    '的', '了', '是', '在', '和', '与', '及', '或', '也', '都', '就', '而', '被', '把', '将',
    '这', '那', '个', '我', '你', '他', '她', '它', '们', '吗', '呢', '吧', '啊', '着', '过',
];

/// A corpus entry whose similarity to the query exceeded the threshold
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub id: i64,
    pub score: f64,
}

/// Lowercase, split on non-alphanumerics and Chinese particles, drop short tokens and stopwords
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() || CJK_PARTICLES.contains(&c))
        .filter(|t| t.chars().count() > 2)
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, f64> {
    let mut tf: HashMap<&str, f64> = HashMap::new();
    for token in tokens {
        *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
    }
    tf
}

fn weigh<'a>(tokens: &'a [String], idf: &dyn Fn(&str) -> f64) -> HashMap<&'a str, f64> {
    let mut tf = term_frequencies(tokens);
    for (term, weight) in tf.iter_mut() {
        *weight *= idf(term);
    }
    tf
}

fn cosine(a: &HashMap<&str, f64>, b: &HashMap<&str, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, wa)| b.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Return corpus entries whose TF-IDF cosine similarity to `query` exceeds `threshold`,
/// sorted by score descending.
///
/// IDF is computed over the corpus plus the query as one document set.
pub fn find_similar<S: AsRef<str>>(
    query: &str,
    corpus: &[(i64, S)],
    threshold: f64,
) -> Vec<SimilarMatch> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() || corpus.is_empty() {
        return Vec::new();
    }
    let doc_tokens: Vec<Vec<String>> = corpus.iter().map(|(_, t)| tokenize(t.as_ref())).collect();

    let n = (corpus.len() + 1) as f64;
    let mut df: HashMap<&str, f64> = HashMap::new();
    for tokens in std::iter::once(&query_tokens).chain(doc_tokens.iter()) {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in unique {
            *df.entry(term).or_insert(0.0) += 1.0;
        }
    }
    // +1 keeps terms shared by every document from zeroing out
    let idf = |term: &str| ((n + 1.0) / (df.get(term).copied().unwrap_or(0.0) + 1.0)).ln() + 1.0;

    let query_vec = weigh(&query_tokens, &idf);
    let mut matches: Vec<SimilarMatch> = corpus
        .iter()
        .zip(doc_tokens.iter())
        .filter_map(|((id, _), tokens)| {
            let raw = cosine(&query_vec, &weigh(tokens, &idf));
            let score = ((raw * 10_000.0).round() / 10_000.0).min(1.0);
            (score > threshold).then_some(SimilarMatch { id: *id, score })
        })
        .collect();

    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_similarity_is_exact() {
        let text = "Avoid calling unwrap on database results inside request handlers";
        let matches = find_similar(text, &[(1, text)], DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(matches, vec![SimilarMatch { id: 1, score: 1.0 }]);
    }

    #[test]
    fn test_tokenize_drops_short_and_stopwords() {
        let tokens = tokenize("The DB is on fire, and we're rebuilding it: index_rebuild!");
        assert_eq!(tokens, vec!["fire", "rebuilding", "index", "rebuild"]);
    }

    #[test]
    fn test_empty_query_yields_nothing() {
        assert!(find_similar("a an of", &[(1, "a an of")], 0.0).is_empty());
        assert!(find_similar("", &[(1, "something here")], 0.0).is_empty());
    }

    #[test]
    fn test_unrelated_text_below_threshold() {
        let corpus = [
            (1, "Use parameterized queries for sqlite inserts"),
            (2, "Prefer async file reads in the watcher loop"),
        ];
        let matches = find_similar("parameterized sqlite queries for inserts", &corpus, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, 1);
    }

    #[test]
    fn test_sorted_descending() {
        let corpus = [
            (1, "retry failed network requests with backoff"),
            (2, "retry failed network requests with exponential backoff and jitter"),
            (3, "retry failed network requests with backoff"),
        ];
        let matches = find_similar("retry failed network requests with backoff", &corpus, 0.1);
        assert_eq!(matches.len(), 3);
        assert!(matches[0].score >= matches[1].score);
        assert!(matches[1].score >= matches[2].score);
        assert_eq!(matches[2].id, 2);
    }

    #[test]
    fn test_chinese_tokens_survive() {
        let tokens = tokenize("数据库连接池 已经耗尽");
        assert_eq!(tokens, vec!["数据库连接池", "已经耗尽"]);
    }

    #[test]
    fn test_chinese_particles_split_runs() {
        let tokens = tokenize("我们的数据库连接池是在高峰期耗尽了");
        assert_eq!(tokens, vec!["数据库连接池", "高峰期耗尽"]);

        let a = "数据库连接池的超时配置";
        let b = "修改了数据库连接池的超时配置";
        let matches = find_similar(a, &[(1, b)], DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(matches, vec![SimilarMatch { id: 1, score: 1.0 }]);
    }
}
