//! Prompt construction for market rounds and the arbiter.
//!
//! Every prompt embeds the exact JSON contract the model must follow;
//! the normalizer's recovery heuristics pick up the stragglers that
//! wrap their JSON in prose anyway.

use crate::types::ProviderAnswer;

use super::convergence::Disagreement;

/// Byte cap applied to peer answers quoted in revision prompts.
const PEER_ANSWER_LIMIT: usize = 1500;

/// The JSON shape requested from every provider in every round.
const ROUND_CONTRACT: &str = r#"Respond with valid JSON only, in exactly this format:
{
  "answer": "your full answer as a string",
  "confidence": 0.0 to 1.0,
  "key_claims": ["short factual assertions your answer rests on"],
  "assumptions": ["assumptions you made"],
  "citations": [{"title": "source title or null", "url": "source url or null"}]
}
No text outside the JSON object."#;

/// The JSON shape requested from the arbiter.
const ARBITER_CONTRACT: &str = r#"Respond with valid JSON only, in exactly this format:
{
  "final_answer": "the single best synthesized answer",
  "agreements": ["points all providers agree on"],
  "conflicts": [{
    "topic": "what they disagree about",
    "claims": [{"provider": "provider name", "claim": "their claim"}],
    "resolution": "how you resolved it",
    "status": "RESOLVED" or "UNRESOLVED",
    "confidence": 0.0 to 1.0
  }],
  "fact_table": [{"claim": "a factual claim", "support": ["providers backing it"], "confidence": 0.0 to 1.0}],
  "next_questions": ["useful follow-up questions"],
  "overall_confidence": 0.0 to 1.0,
  "dredd_failed": false
}
No text outside the JSON object."#;

// ---------------------------------------------------------------------------
// Round prompts
// ---------------------------------------------------------------------------

/// The opening prompt, identical for every provider.
pub fn round_one(question: &str) -> String {
    let mut prompt = String::with_capacity(600 + question.len());
    prompt.push_str(
        "You are one of several independent experts answering the same question. \
         Answer accurately and state your key claims explicitly so they can be \
         compared with the other experts' claims.\n\n",
    );
    prompt.push_str(&format!("QUESTION: {question}\n\n"));
    prompt.push_str(ROUND_CONTRACT);
    prompt
}

/// A revision prompt for one provider: its own previous answer, a
/// summary of every peer's answer, and the detected disagreements.
pub fn revision(
    question: &str,
    own: &ProviderAnswer,
    peers: &[&ProviderAnswer],
    disagreements: &[Disagreement],
) -> String {
    let mut prompt = String::with_capacity(2000 + question.len());

    prompt.push_str(
        "You previously answered this question alongside other independent experts. \
         Review their answers, then give your revised answer. Keep your position \
         where you are confident; update it where a peer's evidence is stronger.\n\n",
    );
    prompt.push_str(&format!("QUESTION: {question}\n\n"));

    prompt.push_str("YOUR PREVIOUS ANSWER:\n");
    prompt.push_str(&format!(
        "confidence: {}\n{}\n",
        format_confidence(own.confidence),
        own.answer
    ));
    push_claims(&mut prompt, own.key_claims.as_deref());

    for peer in peers {
        prompt.push_str(&format!(
            "\nANSWER FROM {} ({}):\nconfidence: {}\n{}\n",
            peer.provider.as_str().to_uppercase(),
            peer.model,
            format_confidence(peer.confidence),
            truncate_bytes(&peer.answer, PEER_ANSWER_LIMIT),
        ));
        push_claims(&mut prompt, peer.key_claims.as_deref());
    }

    if !disagreements.is_empty() {
        prompt.push_str("\nPOINTS OF DISAGREEMENT:\n");
        for disagreement in disagreements {
            prompt.push_str(&format!("- {}:\n", disagreement.topic));
            for (provider, claim) in &disagreement.claims {
                prompt.push_str(&format!("    {provider}: {claim}\n"));
            }
        }
    }

    prompt.push('\n');
    prompt.push_str(ROUND_CONTRACT);
    prompt
}

// ---------------------------------------------------------------------------
// Arbiter prompt
// ---------------------------------------------------------------------------

/// The synthesis prompt, carrying every final-round answer in full.
pub fn arbiter(question: &str, answers: &[ProviderAnswer], rounds_completed: u32) -> String {
    let mut prompt = String::with_capacity(3000 + question.len());

    prompt.push_str(
        "You are the arbiter. Several independent experts have answered the \
         question below and revised their answers over deliberation rounds. \
         Synthesize one final answer, list what they agree on, resolve their \
         conflicts where possible, and build a fact table.\n\n",
    );
    prompt.push_str(&format!("QUESTION: {question}\n"));
    prompt.push_str(&format!("DELIBERATION ROUNDS: {rounds_completed}\n"));

    for answer in answers {
        prompt.push_str(&format!(
            "\n--- {} ({}) ---\nconfidence: {}\n{}\n",
            answer.provider.as_str().to_uppercase(),
            answer.model,
            format_confidence(answer.confidence),
            answer.answer,
        ));
        push_claims(&mut prompt, answer.key_claims.as_deref());
    }

    prompt.push('\n');
    prompt.push_str(ARBITER_CONTRACT);
    prompt
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_confidence(confidence: Option<f64>) -> String {
    match confidence {
        Some(c) => format!("{c:.2}"),
        None => "unreported".to_string(),
    }
}

fn push_claims(prompt: &mut String, claims: Option<&[String]>) {
    let Some(claims) = claims.filter(|c| !c.is_empty()) else {
        return;
    };
    prompt.push_str("key claims:\n");
    for claim in claims {
        prompt.push_str(&format!("  - {claim}\n"));
    }
}

/// Truncate to at most `limit` bytes on a char boundary.
fn truncate_bytes(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
