//! Convergence detection over one round of provider answers.
//!
//! Stateless. Measures the spread of self-reported confidences and the
//! Jaccard overlap of normalized key claims, and extracts claim-level
//! disagreements to feed into the next round's prompts.

use std::collections::{BTreeMap, HashSet};

use crate::types::{ProviderAnswer, ProviderKind};

/// Cap on disagreement buckets handed to the next round.
const MAX_DISAGREEMENTS: usize = 5;

/// Result of evaluating one round.
#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    pub confidence_delta: f64,
    pub claim_overlap: f64,
    pub converged: bool,
    pub disagreements: Vec<Disagreement>,
}

/// Providers holding different claims about one topic.
#[derive(Debug, Clone)]
pub struct Disagreement {
    pub topic: String,
    pub claims: Vec<(ProviderKind, String)>,
}

/// Evaluate one round of answers against the stop thresholds.
pub fn evaluate(
    answers: &[ProviderAnswer],
    confidence_threshold: f64,
    overlap_threshold: f64,
) -> ConvergenceReport {
    let confidence_delta = confidence_delta(answers);
    let claim_overlap = claim_overlap(answers);
    let converged =
        confidence_delta <= confidence_threshold && claim_overlap >= overlap_threshold;

    ConvergenceReport {
        confidence_delta,
        claim_overlap,
        converged,
        disagreements: disagreements(answers),
    }
}

// ---------------------------------------------------------------------------
// Confidence delta
// ---------------------------------------------------------------------------

/// Spread of the non-null confidences: `max - min`. With no reported
/// confidence the round cannot have converged (1.0); a single value has
/// no spread (0.0).
pub fn confidence_delta(answers: &[ProviderAnswer]) -> f64 {
    let confidences: Vec<f64> = answers.iter().filter_map(|a| a.confidence).collect();
    match confidences.len() {
        0 => 1.0,
        1 => 0.0,
        _ => {
            let max = confidences.iter().cloned().fold(f64::MIN, f64::max);
            let min = confidences.iter().cloned().fold(f64::MAX, f64::min);
            max - min
        }
    }
}

// ---------------------------------------------------------------------------
// Claim overlap
// ---------------------------------------------------------------------------

/// Average pairwise Jaccard similarity of the normalized claim sets.
/// No claim sets → 0.0; a single set → 1.0.
pub fn claim_overlap(answers: &[ProviderAnswer]) -> f64 {
    let sets: Vec<HashSet<String>> = answers
        .iter()
        .filter_map(|a| a.key_claims.as_ref())
        .filter(|claims| !claims.is_empty())
        .map(|claims| claims.iter().map(|c| normalize_claim(c)).collect())
        .collect();

    match sets.len() {
        0 => 0.0,
        1 => 1.0,
        n => {
            let mut total = 0.0;
            let mut pairs = 0u32;
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        total += jaccard(&sets[i], &sets[j]);
                        pairs += 1;
                    }
                }
            }
            total / f64::from(pairs)
        }
    }
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`; 1.0 when the union is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}

/// Lowercase, drop non-word/non-space characters, collapse whitespace.
pub fn normalize_claim(claim: &str) -> String {
    claim
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Disagreement extraction
// ---------------------------------------------------------------------------

/// Group claims by topic and report topics where providers state
/// different normalized claims.
///
/// The topic key is the first three significant tokens (length > 2) of
/// the normalized claim, so near-identical phrasings of one subject
/// land in the same bucket while still comparing as distinct claims.
pub fn disagreements(answers: &[ProviderAnswer]) -> Vec<Disagreement> {
    // BTreeMap keeps bucket order deterministic across runs.
    let mut buckets: BTreeMap<String, Vec<(ProviderKind, String, String)>> = BTreeMap::new();

    for answer in answers {
        let Some(claims) = answer.key_claims.as_ref() else {
            continue;
        };
        for claim in claims {
            let normalized = normalize_claim(claim);
            if normalized.is_empty() {
                continue;
            }
            buckets
                .entry(topic_key(&normalized))
                .or_default()
                .push((answer.provider, normalized, claim.clone()));
        }
    }

    buckets
        .into_iter()
        .filter(|(_, entries)| {
            let distinct_claims: HashSet<&str> =
                entries.iter().map(|(_, n, _)| n.as_str()).collect();
            let distinct_providers: HashSet<ProviderKind> =
                entries.iter().map(|(p, _, _)| *p).collect();
            distinct_claims.len() >= 2 && distinct_providers.len() >= 2
        })
        .take(MAX_DISAGREEMENTS)
        .map(|(topic, entries)| Disagreement {
            topic,
            claims: entries
                .into_iter()
                .map(|(provider, _, original)| (provider, original))
                .collect(),
        })
        .collect()
}

fn topic_key(normalized: &str) -> String {
    let significant: Vec<&str> = normalized
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .take(3)
        .collect();
    if significant.is_empty() {
        normalized.to_string()
    } else {
        significant.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
