//! Hybrid ranking and token-budget truncation.
//!
//! # Scoring
//!
//! 1. Normalize keyword and semantic scores by their side's maximum.
//! 2. Merge: `score = w_kw × keyword + w_sem × semantic`, missing side = 0.
//! 3. Sort by score (desc), source mtime (desc), input order (asc).
//!
//! Input order is the keyword list followed by semantic-only ids in
//! semantic order, so equal inputs always rank identically.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Blend weights for the two score sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    pub keyword: f64,
    pub semantic: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            semantic: 0.6,
        }
    }
}

/// A merged candidate with its score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub chunk_id: String,
    pub score: f64,
    /// Normalized keyword score (0.0 if absent from keyword results).
    pub keyword_score: f64,
    /// Normalized semantic score (0.0 if absent from semantic results).
    pub semantic_score: f64,
}

/// Divide every score by the maximum. A non-positive maximum zeroes the side.
///
/// Negative inputs (e.g. cosine similarity below zero) clamp to 0.
pub fn normalize_by_max(scores: &[(String, f64)]) -> HashMap<String, f64> {
    let max = scores.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|(id, s)| {
            let n = if max > 0.0 { (s / max).max(0.0) } else { 0.0 };
            (id.clone(), n)
        })
        .collect()
}

/// Blend keyword and semantic results into one list, each id exactly once.
///
/// `mtime_of` supplies the source modification time used to break ties;
/// ids it does not know sort as oldest.
pub fn merge<F>(
    keyword: &[(String, f64)],
    semantic: &[(String, f64)],
    weights: RankWeights,
    mtime_of: F,
) -> Vec<RankedChunk>
where
    F: Fn(&str) -> Option<i64>,
{
    let norm_kw = normalize_by_max(keyword);
    let norm_sem = normalize_by_max(semantic);

    let mut order: Vec<&str> = Vec::with_capacity(keyword.len() + semantic.len());
    let mut seen: HashSet<&str> = HashSet::new();
    for (id, _) in keyword.iter().chain(semantic.iter()) {
        if seen.insert(id.as_str()) {
            order.push(id.as_str());
        }
    }

    let mut ranked: Vec<(usize, i64, RankedChunk)> = order
        .into_iter()
        .enumerate()
        .map(|(pos, id)| {
            let kw = norm_kw.get(id).copied().unwrap_or(0.0);
            let sem = norm_sem.get(id).copied().unwrap_or(0.0);
            let mtime = mtime_of(id).unwrap_or(i64::MIN);
            (
                pos,
                mtime,
                RankedChunk {
                    chunk_id: id.to_string(),
                    score: weights.keyword * kw + weights.semantic * sem,
                    keyword_score: kw,
                    semantic_score: sem,
                },
            )
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.2.score
            .partial_cmp(&a.2.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.0.cmp(&b.0))
    });

    ranked.into_iter().map(|(_, _, r)| r).collect()
}

/// Result of [`truncate_to_budget`].
#[derive(Debug, Clone, PartialEq)]
pub struct Truncated<T> {
    pub kept: Vec<T>,
    pub used_tokens: usize,
    /// Items left out, counted from the first one that overflowed.
    pub dropped: usize,
}

/// Keep items in order until the next one would overflow `budget`.
///
/// Stops at the first overflowing item rather than skipping ahead to smaller
/// ones, so the kept list is always a prefix of the ranking. No item is
/// ever cut partially.
pub fn truncate_to_budget<T, F>(ranked: Vec<T>, budget: usize, tokens: F) -> Truncated<T>
where
    F: Fn(&T) -> usize,
{
    let total = ranked.len();
    let mut kept = Vec::new();
    let mut used = 0;

    for item in ranked {
        let cost = tokens(&item);
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(item);
    }

    Truncated {
        dropped: total - kept.len(),
        kept,
        used_tokens: used,
    }
}

/// Smallest budget handed out regardless of the window.
pub const MIN_CONTEXT_TOKENS: usize = 500;

/// Tokens available for retrieved context in a model window.
///
/// `reserve_percent` is the share of the window given to context; the rest
/// is left for the model's response.
pub fn budget_for_context_window(context_window: usize, reserve_percent: f64) -> usize {
    let budget = (context_window as f64 * reserve_percent.clamp(0.0, 1.0)) as usize;
    budget.max(MIN_CONTEXT_TOKENS.min(context_window))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_normalize_by_max() {
        let n = normalize_by_max(&scores(&[("a", 2.0), ("b", 1.0), ("c", -0.5)]));
        assert_eq!(n["a"], 1.0);
        assert_eq!(n["b"], 0.5);
        assert_eq!(n["c"], 0.0);
    }

    #[test]
    fn test_normalize_zero_max_zeroes_side() {
        let n = normalize_by_max(&scores(&[("a", 0.0), ("b", 0.0)]));
        assert!(n.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_merge_weights_and_dedup() {
        let kw = scores(&[("a", 4.0), ("b", 2.0)]);
        let sem = scores(&[("b", 0.9), ("c", 0.45)]);
        let ranked = merge(&kw, &sem, RankWeights::default(), |_| None);

        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        // b: 0.4*0.5 + 0.6*1.0 = 0.8, a: 0.4, c: 0.3
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!((ranked[0].score - 0.8).abs() < 1e-9);
        assert_eq!(ranked[1].semantic_score, 0.0);
    }

    #[test]
    fn test_merge_tie_breaks_by_mtime_then_input_order() {
        let kw = scores(&[("old", 1.0), ("new", 1.0), ("first", 1.0)]);
        let mtimes: HashMap<&str, i64> = [("old", 10), ("new", 20)].into_iter().collect();
        let ranked = merge(&kw, &[], RankWeights::default(), |id| mtimes.get(id).copied());
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "first"]);

        let ranked = merge(&kw, &[], RankWeights::default(), |_| Some(5));
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new", "first"]);
    }

    #[test]
    fn test_merge_keyword_only_when_semantic_empty() {
        let kw = scores(&[("a", 3.0), ("b", 1.0)]);
        let ranked = merge(&kw, &[], RankWeights::default(), |_| None);
        assert_eq!(ranked[0].chunk_id, "a");
        assert!((ranked[0].score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_truncate_stops_at_first_overflow() {
        let ranked = vec![("a", 300), ("b", 300), ("c", 300), ("d", 10)];
        let t = truncate_to_budget(ranked, 700, |(_, tokens)| *tokens);
        assert_eq!(t.kept.len(), 2);
        assert_eq!(t.used_tokens, 600);
        assert_eq!(t.dropped, 2);
    }

    #[test]
    fn test_truncate_never_exceeds_budget() {
        let ranked = vec![800usize];
        let t = truncate_to_budget(ranked, 700, |t| *t);
        assert!(t.kept.is_empty());
        assert_eq!(t.used_tokens, 0);
        assert_eq!(t.dropped, 1);
    }

    #[test]
    fn test_budget_for_context_window() {
        assert_eq!(budget_for_context_window(4096, 0.70), 2867);
        assert_eq!(budget_for_context_window(600, 0.5), 500);
        assert_eq!(budget_for_context_window(200, 0.5), 200);
    }
}
