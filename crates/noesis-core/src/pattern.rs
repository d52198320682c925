//! Procedural-memory matcher (C7, §4.7): evaluates a query against a user's
//! stored patterns and decides which one, if any, should be injected into
//! the assembled [`crate::model::MemoryContext`].

use regex::Regex;

use crate::model::{ProceduralPattern, Trigger, TriggerKind};

/// Case-insensitive whole-word containment, the keyword trigger's match
/// rule.
fn keyword_matches(content: &str, pattern: &str) -> bool {
    let content = content.to_lowercase();
    let pattern = pattern.to_lowercase();
    content
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == pattern)
}

fn trigger_matches(trigger: &Trigger, query: &str, query_embedding: Option<&[f32]>, pattern: &ProceduralPattern) -> bool {
    match trigger.kind {
        TriggerKind::Keyword => keyword_matches(query, &trigger.pattern),
        TriggerKind::Regex => Regex::new(&trigger.pattern)
            .map(|re| re.is_match(query))
            .unwrap_or(false),
        TriggerKind::Semantic => match (query_embedding, &pattern.embedding) {
            (Some(q), Some(p)) => {
                crate::embeddings::cosine_similarity(q, p) as f64 >= pattern.confidence_threshold
            }
            _ => false,
        },
    }
}

/// Evaluates `query` against `patterns` in order (as stored) and returns the
/// first whose any trigger matches, per §4.7's tie-break: `usage_count`
/// descending, then `created_at` ascending, applied only among equally-first
/// matches encountered in the same pass.
///
/// The returned pattern has already had `touch()` applied; callers are
/// responsible for persisting the mutation via
/// [`crate::storage::ProceduralRepo::touch`].
pub fn match_pattern(
    query: &str,
    query_embedding: Option<&[f32]>,
    patterns: &[ProceduralPattern],
) -> Option<ProceduralPattern> {
    let mut matched: Vec<&ProceduralPattern> = patterns
        .iter()
        .filter(|pattern| {
            pattern
                .triggers
                .iter()
                .any(|trigger| trigger_matches(trigger, query, query_embedding, pattern))
        })
        .collect();

    matched.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    matched.first().map(|pattern| {
        let mut winner = (*pattern).clone();
        winner.touch();
        winner
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProceduralPattern;

    fn keyword_pattern(name: &str, keyword: &str) -> ProceduralPattern {
        ProceduralPattern::new(
            "u1",
            name,
            "test pattern",
            vec![Trigger {
                kind: TriggerKind::Keyword,
                pattern: keyword.to_string(),
            }],
            format!("instructions for {name}"),
            0.5,
        )
    }

    #[test]
    fn keyword_trigger_matches_whole_word_only() {
        let pattern = keyword_pattern("db", "database");
        assert!(match_pattern("I need a database", None, std::slice::from_ref(&pattern)).is_some());
        assert!(match_pattern("databaser is not a word", None, std::slice::from_ref(&pattern)).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let pattern = keyword_pattern("db", "database");
        assert!(match_pattern("what's the weather", None, std::slice::from_ref(&pattern)).is_none());
    }

    #[test]
    fn matching_touches_usage_and_last_used() {
        let pattern = keyword_pattern("db", "database");
        let matched = match_pattern("I need a database", None, std::slice::from_ref(&pattern)).unwrap();
        assert_eq!(matched.usage_count, 1);
        assert!(matched.last_used.is_some());
    }

    #[test]
    fn ties_broken_by_usage_count_then_created_at() {
        let mut low_usage = keyword_pattern("a", "database");
        let mut high_usage = keyword_pattern("b", "database");
        low_usage.usage_count = 1;
        high_usage.usage_count = 5;
        let patterns = vec![low_usage, high_usage.clone()];
        let matched = match_pattern("I need a database", None, &patterns).unwrap();
        assert_eq!(matched.name, high_usage.name);
    }

    #[test]
    fn regex_trigger_matches_compiled_pattern() {
        let pattern = ProceduralPattern::new(
            "u1",
            "email_lookup",
            "d",
            vec![Trigger {
                kind: TriggerKind::Regex,
                pattern: r"\bemail\b".to_string(),
            }],
            "instr",
            0.5,
        );
        assert!(match_pattern("what's my email address", None, std::slice::from_ref(&pattern)).is_some());
    }

    #[test]
    fn semantic_trigger_requires_both_embeddings_above_threshold() {
        let mut pattern = ProceduralPattern::new(
            "u1",
            "sem",
            "d",
            vec![Trigger {
                kind: TriggerKind::Semantic,
                pattern: String::new(),
            }],
            "instr",
            0.9,
        );
        pattern.embedding = Some(vec![1.0, 0.0, 0.0]);
        let query_embedding = vec![1.0, 0.0, 0.0];
        assert!(match_pattern("anything", Some(&query_embedding), std::slice::from_ref(&pattern)).is_some());

        let orthogonal = vec![0.0, 1.0, 0.0];
        assert!(match_pattern("anything", Some(&orthogonal), std::slice::from_ref(&pattern)).is_none());
    }
}
