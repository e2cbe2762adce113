//! Model pricing and per-call cost computation.
//!
//! Maps a model string to USD rates per 1K input/output tokens. Lookup
//! tries an exact match first, then the longest key that is a prefix of
//! the model string. Unknown models yield no cost rather than a guess.

use crate::types::round_usd;

/// USD per 1K tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Static price book. Keys are exact model strings or family prefixes;
/// longer prefixes take precedence at lookup time.
const PRICE_BOOK: &[(&str, ModelRates)] = &[
    // OpenAI
    ("gpt-4o", ModelRates { input_per_1k: 0.005, output_per_1k: 0.015 }),
    ("gpt-4o-mini", ModelRates { input_per_1k: 0.00015, output_per_1k: 0.0006 }),
    ("gpt-4-turbo", ModelRates { input_per_1k: 0.01, output_per_1k: 0.03 }),
    ("gpt-3.5-turbo", ModelRates { input_per_1k: 0.0005, output_per_1k: 0.0015 }),
    // Anthropic
    ("claude-opus", ModelRates { input_per_1k: 0.015, output_per_1k: 0.075 }),
    ("claude-sonnet", ModelRates { input_per_1k: 0.003, output_per_1k: 0.015 }),
    ("claude-haiku", ModelRates { input_per_1k: 0.0008, output_per_1k: 0.004 }),
    ("claude-3-5-sonnet", ModelRates { input_per_1k: 0.003, output_per_1k: 0.015 }),
    ("claude-3-5-haiku", ModelRates { input_per_1k: 0.0008, output_per_1k: 0.004 }),
    // Gemini
    ("gemini-2.0-flash", ModelRates { input_per_1k: 0.0001, output_per_1k: 0.0004 }),
    ("gemini-1.5-pro", ModelRates { input_per_1k: 0.00125, output_per_1k: 0.005 }),
    ("gemini-1.5-flash", ModelRates { input_per_1k: 0.000075, output_per_1k: 0.0003 }),
];

/// Find the rates for a model string: exact match wins, otherwise the
/// longest prefix match.
pub fn rates_for(model: &str) -> Option<ModelRates> {
    if let Some((_, rates)) = PRICE_BOOK.iter().find(|(key, _)| *key == model) {
        return Some(*rates);
    }

    PRICE_BOOK
        .iter()
        .filter(|(key, _)| model.starts_with(key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, rates)| *rates)
}

/// Compute the USD cost of one call, rounded to 6 decimals.
/// Returns None for models with no known pricing.
pub fn cost_usd(model: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
    let rates = rates_for(model)?;
    let cost = (input_tokens as f64 / 1000.0) * rates.input_per_1k
        + (output_tokens as f64 / 1000.0) * rates.output_per_1k;
    Some(round_usd(cost))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
