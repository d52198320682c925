//! Importance engine ("amygdala", C3, §4.3): a pure, deterministic composite
//! scorer. Given a message and a handful of recent messages from the same
//! conversation, returns a score in `[0, 1]` used by the orchestrator to
//! decide initial placement and by consolidation to decide promotion.
//!
//! No I/O: novelty falls back to a Jaccard estimate over word n-grams when
//! no embedding is available, rather than calling out for one.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::{HeuristicsConfig, ImportanceWeights};
use crate::embeddings::cosine_similarity;
use crate::model::{Message, Role};

/// Score bands §4.3 partitions the composite into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportanceBand {
    Critical,
    High,
    Normal,
    Low,
}

impl ImportanceBand {
    pub fn for_score(score: f64) -> Self {
        if score >= 0.80 {
            ImportanceBand::Critical
        } else if score >= 0.60 {
            ImportanceBand::High
        } else if score >= 0.40 {
            ImportanceBand::Normal
        } else {
            ImportanceBand::Low
        }
    }
}

static DECISION_MARKERS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "decided",
        "decision",
        "we will",
        "i will",
        "let's go with",
        "remember",
        "important",
        "from now on",
        "always",
        "never",
    ]
});

static EXPLICIT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)!important|\bTODO\b|\bNOTE\b").unwrap());

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```").unwrap());
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*([-*]|\d+\.)\s").unwrap());
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z][a-zA-Z0-9]*(_[a-zA-Z0-9]+)+\b|\b[a-z]+[A-Z][a-zA-Z0-9]*\b").unwrap());

static POSITIVE_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["great", "love", "thanks", "perfect", "excellent", "good", "awesome", "happy"]
        .into_iter()
        .collect()
});
static NEGATIVE_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["broken", "bug", "hate", "terrible", "wrong", "fail", "failed", "error", "angry", "frustrated"]
        .into_iter()
        .collect()
});

/// Pure, deterministic importance scorer.
///
/// Holds no state beyond configuration; safe to share behind an `Arc` or
/// construct fresh per call.
pub struct ImportanceEngine {
    config: HeuristicsConfig,
}

/// A breakdown of the composite score's inputs, useful for logging and
/// tests; not part of the stored [`Message`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceBreakdown {
    pub base: f64,
    pub decision_marker: f64,
    pub question: f64,
    pub novelty: f64,
    pub sentiment: f64,
    pub technical_depth: f64,
    pub recency: f64,
    pub composite: f64,
}

impl ImportanceEngine {
    pub fn new(config: HeuristicsConfig) -> Self {
        Self { config }
    }

    /// Scores `message` given up to the `n` most recent prior messages from
    /// the same conversation (`recent`, oldest first, `message` excluded)
    /// and an optional embedding for `message`'s content. Pure: never
    /// suspends, never allocates I/O resources.
    pub fn score(
        &self,
        message: &Message,
        recent: &[Message],
        embedding: Option<&[f32]>,
        recent_embeddings: &[Option<Vec<f32>>],
    ) -> ImportanceBreakdown {
        let w = &self.config.importance_weights;
        let base = Self::base_signal(&message.content);
        let decision_marker = Self::decision_marker_signal(&message.content);
        let question = Self::question_weight(message);
        let novelty = Self::novelty_signal(message, recent, embedding, recent_embeddings);
        let sentiment = Self::sentiment_signal(&message.content);
        let technical_depth = Self::technical_depth_signal(&message.content);
        let recency = Self::recency_signal(message.timestamp, self.config.recency_tau_secs);

        let weighted = w.base * base
            + w.decision_marker * decision_marker
            + w.question * question
            + w.novelty * novelty
            + w.sentiment * sentiment
            + w.technical_depth * technical_depth
            + w.recency * recency;

        let dampened = weighted * self.config.dampening;
        let composite = if dampened <= 0.0 {
            self.config.importance_default
        } else {
            dampened.clamp(0.0, 1.0)
        };

        ImportanceBreakdown {
            base,
            decision_marker,
            question,
            novelty,
            sentiment,
            technical_depth,
            recency,
            composite,
        }
    }

    fn base_signal(content: &str) -> f64 {
        let len_component = (content.len() as f64 / 500.0).min(1.0);
        let structural = [
            CODE_FENCE.is_match(content),
            URL.is_match(content),
            LIST_ITEM.is_match(content),
        ]
        .into_iter()
        .filter(|b| *b)
        .count() as f64
            / 3.0;
        (0.6 * len_component + 0.4 * structural).clamp(0.0, 1.0)
    }

    fn decision_marker_signal(content: &str) -> f64 {
        let lower = content.to_lowercase();
        let hits = DECISION_MARKERS
            .iter()
            .filter(|marker| lower.contains(*marker))
            .count();
        let base = (hits as f64 / 2.0).min(1.0);
        let boosted = if EXPLICIT_MARKER.is_match(content) { 1.0 } else { base };
        let caps_ratio = caps_word_ratio(content);
        (boosted + 0.2 * caps_ratio).clamp(0.0, 1.0)
    }

    fn question_weight(message: &Message) -> f64 {
        let is_question = message.content.trim_end().ends_with('?')
            || message.content.to_lowercase().starts_with("what")
            || message.content.to_lowercase().starts_with("who")
            || message.content.to_lowercase().starts_with("when")
            || message.content.to_lowercase().starts_with("how");
        if !is_question {
            return 0.5;
        }
        if message.role == Role::User {
            0.2
        } else {
            0.4
        }
    }

    fn novelty_signal(
        message: &Message,
        recent: &[Message],
        embedding: Option<&[f32]>,
        recent_embeddings: &[Option<Vec<f32>>],
    ) -> f64 {
        if recent.is_empty() {
            return 1.0;
        }

        if let Some(query_vec) = embedding {
            let mut max_sim = 0.0_f32;
            let mut any = false;
            for candidate in recent_embeddings.iter().flatten() {
                if candidate.len() != query_vec.len() {
                    continue;
                }
                any = true;
                max_sim = max_sim.max(cosine_similarity(query_vec, candidate));
            }
            if any {
                return (1.0 - max_sim as f64).clamp(0.0, 1.0);
            }
        }

        let query_grams = word_ngrams(&message.content, 2);
        let mut max_jaccard = 0.0_f64;
        for other in recent {
            let other_grams = word_ngrams(&other.content, 2);
            max_jaccard = max_jaccard.max(jaccard(&query_grams, &other_grams));
        }
        (1.0 - max_jaccard).clamp(0.0, 1.0)
    }

    fn sentiment_signal(content: &str) -> f64 {
        let lower = content.to_lowercase();
        let mut score = 0.0_f64;
        let mut total = 0usize;
        for word in lower.split_whitespace() {
            let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if POSITIVE_WORDS.contains(cleaned.as_str()) {
                score += 1.0;
                total += 1;
            } else if NEGATIVE_WORDS.contains(cleaned.as_str()) {
                score -= 1.0;
                total += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        (score.abs() / total as f64).clamp(0.0, 1.0)
    }

    fn technical_depth_signal(content: &str) -> f64 {
        let fence_hits = CODE_FENCE.find_iter(content).count();
        let identifier_hits = IDENTIFIER.find_iter(content).count();
        let words = content.split_whitespace().count().max(1);
        let density = identifier_hits as f64 / words as f64;
        (0.5 * (fence_hits as f64 / 2.0).min(1.0) + 0.5 * (density * 5.0).min(1.0)).clamp(0.0, 1.0)
    }

    fn recency_signal(timestamp: DateTime<Utc>, tau_secs: f64) -> f64 {
        let age_secs = (Utc::now() - timestamp).num_milliseconds() as f64 / 1000.0;
        (-age_secs.max(0.0) / tau_secs.max(1.0)).exp()
    }
}

fn caps_word_ratio(content: &str) -> f64 {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let shouting = words
        .iter()
        .filter(|w| w.len() >= 3 && w.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()))
        .count();
    shouting as f64 / words.len() as f64
}

fn word_ngrams(text: &str, n: usize) -> HashSet<String> {
    let words: Vec<&str> = text.to_lowercase().split_whitespace().collect();
    if words.len() < n {
        return words.into_iter().map(String::from).collect();
    }
    words
        .windows(n)
        .map(|window| window.join(" "))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ImportanceEngine {
        ImportanceEngine::new(HeuristicsConfig::default())
    }

    #[test]
    fn score_is_always_in_unit_range() {
        let e = engine();
        let msg = Message::new("u1", "c1", Role::User, "hello there, how are you?");
        let result = e.score(&msg, &[], None, &[]);
        assert!(result.composite >= 0.0 && result.composite <= 1.0);
    }

    #[test]
    fn decision_language_boosts_score() {
        let e = engine();
        let plain = Message::new("u1", "c1", Role::User, "ok");
        let decisive = Message::new(
            "u1",
            "c1",
            Role::Assistant,
            "We decided to go with PostgreSQL. Remember this for later, it's important.",
        );
        let plain_score = e.score(&plain, &[], None, &[]).composite;
        let decisive_score = e.score(&decisive, &[], None, &[]).composite;
        assert!(decisive_score > plain_score);
    }

    #[test]
    fn questions_from_user_are_downweighted_versus_answers() {
        let e = engine();
        let question = Message::new("u1", "c1", Role::User, "What is the deploy process?");
        let answer = Message::new(
            "u1",
            "c1",
            Role::Assistant,
            "What is the deploy process? Run `make deploy` from the release branch.",
        );
        let q = e.score(&question, &[], None, &[]);
        let a = e.score(&answer, &[], None, &[]);
        assert!(q.question < 0.5);
        assert!(a.technical_depth >= q.technical_depth);
    }

    #[test]
    fn near_duplicate_content_has_low_novelty() {
        let e = engine();
        let first = Message::new("u1", "c1", Role::User, "the server keeps crashing on startup");
        let second = Message::new("u1", "c1", Role::User, "the server keeps crashing on startup again");
        let breakdown = e.score(&second, std::slice::from_ref(&first), None, &[None]);
        assert!(breakdown.novelty < 0.5);
    }

    #[test]
    fn band_thresholds_match_spec() {
        assert_eq!(ImportanceBand::for_score(0.9), ImportanceBand::Critical);
        assert_eq!(ImportanceBand::for_score(0.65), ImportanceBand::High);
        assert_eq!(ImportanceBand::for_score(0.45), ImportanceBand::Normal);
        assert_eq!(ImportanceBand::for_score(0.1), ImportanceBand::Low);
    }

    #[test]
    fn deterministic_for_fixed_input() {
        let e = engine();
        let msg = Message::new("u1", "c1", Role::User, "same content every time");
        let a = e.score(&msg, &[], None, &[]).composite;
        let b = e.score(&msg, &[], None, &[]).composite;
        assert_eq!(a, b);
    }
}
