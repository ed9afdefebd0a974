//! Punctuation-insensitive agreement over heterogeneous transcripts.
//!
//! "Hello world.", "hello world" and "Hello, world" all agree after
//! normalization. Consensus is the fast bypass of the correction stage for
//! short, clean, repeated utterances; anything containing filler tokens is
//! routed to correction instead, since removing fillers is that stage's job.

use std::collections::HashMap;

use crate::providers::TranscriptionResult;

/// Tokens that disqualify a normalization from winning consensus.
const FILLER_TOKENS: &[&str] = &[
    "um", "uh", "uhm", "umm", "hmm", "hm", "er", "ah", "like", "you know", "i mean", "sort of",
    "kind of",
];

/// Lowercase, strip everything that is not alphanumeric or whitespace,
/// collapse runs of whitespace, trim.
pub fn normalize_for_matching(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_filler(normalized: &str) -> bool {
    for token in normalized.split_whitespace() {
        if FILLER_TOKENS.contains(&token) {
            return true;
        }
    }
    // Multi-word fillers ("you know", "i mean", …) need a substring check.
    FILLER_TOKENS
        .iter()
        .filter(|f| f.contains(' '))
        .any(|f| normalized.contains(f))
}

/// Decide whether enough transcripts agree.
///
/// Returns the original punctuated text of the first result whose
/// normalization matches the winner, or `None` when: fewer than `threshold`
/// normalizations agree, the winner exceeds `max_words`, or the winner
/// contains a filler token.
pub fn check_consensus(
    results: &[TranscriptionResult],
    threshold: usize,
    max_words: usize,
) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let normalized: Vec<(usize, String)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (i, normalize_for_matching(&r.text)))
        .filter(|(_, n)| !n.is_empty())
        .collect();
    if normalized.is_empty() {
        return None;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, n) in &normalized {
        *counts.entry(n.as_str()).or_insert(0) += 1;
    }
    // Top entry; ties broken by earliest first occurrence for determinism.
    let winner = normalized
        .iter()
        .max_by_key(|(i, n)| (counts[n.as_str()], usize::MAX - i))
        .map(|(_, n)| n.clone())?;
    let count = counts[winner.as_str()];

    if count < threshold {
        return None;
    }
    if winner.split_whitespace().count() > max_words {
        return None;
    }
    if contains_filler(&winner) {
        return None;
    }

    normalized
        .iter()
        .find(|(_, n)| *n == winner)
        .map(|(i, _)| results[*i].text.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(provider: &str, device: &str, text: &str) -> TranscriptionResult {
        TranscriptionResult {
            text: text.to_string(),
            provider: provider.to_string(),
            device: device.to_string(),
            latency_ms: 100,
            confidence: None,
        }
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_for_matching("Hello, world."), "hello world");
        assert_eq!(normalize_for_matching("  Hello   world "), "hello world");
        assert_eq!(normalize_for_matching("don't!"), "dont");
    }

    #[test]
    fn normalize_is_idempotent() {
        for s in ["Hello, world.", "Testing... one, two", "¿Qué tal?", ""] {
            let once = normalize_for_matching(s);
            assert_eq!(normalize_for_matching(&once), once);
        }
    }

    #[test]
    fn punctuation_variants_agree_and_first_original_wins() {
        let results = vec![
            result("pa", "d1", "Hello, world."),
            result("pb", "d1", "hello world"),
            result("pa", "d2", "Hello world"),
            result("pb", "d2", "Hello world!"),
        ];
        let consensus = check_consensus(&results, 2, 10);
        assert_eq!(consensus.as_deref(), Some("Hello, world."));
    }

    #[test]
    fn exactly_threshold_matches_one_fewer_does_not() {
        let two = vec![
            result("pa", "d1", "ship it"),
            result("pb", "d1", "Ship it."),
        ];
        assert!(check_consensus(&two, 2, 10).is_some());

        let one = vec![
            result("pa", "d1", "ship it"),
            result("pb", "d1", "hold on"),
        ];
        assert!(check_consensus(&one, 2, 10).is_none());
    }

    #[test]
    fn word_cap_boundary() {
        let text = "one two three four five";
        let results = vec![result("pa", "d1", text), result("pb", "d1", text)];
        assert!(check_consensus(&results, 2, 5).is_some());
        assert!(check_consensus(&results, 2, 4).is_none());
    }

    #[test]
    fn fillers_defer_to_correction() {
        let results = vec![
            result("pa", "d1", "um send the email"),
            result("pb", "d1", "Um, send the email"),
        ];
        assert!(check_consensus(&results, 2, 10).is_none());

        let multi = vec![
            result("pa", "d1", "you know the drill"),
            result("pb", "d1", "You know the drill"),
        ];
        assert!(check_consensus(&multi, 2, 10).is_none());
    }

    #[test]
    fn filler_must_be_a_whole_token() {
        // "umbrella" contains "um" but is not a filler.
        let results = vec![
            result("pa", "d1", "bring the umbrella"),
            result("pb", "d1", "Bring the umbrella."),
        ];
        assert!(check_consensus(&results, 2, 10).is_some());
    }

    #[test]
    fn empty_normalizations_are_dropped() {
        let results = vec![
            result("pa", "d1", ""),
            result("pb", "d1", "..."),
            result("pa", "d2", "go"),
            result("pb", "d2", "Go!"),
        ];
        assert_eq!(check_consensus(&results, 2, 10).as_deref(), Some("go"));
    }

    #[test]
    fn no_results_no_consensus() {
        assert!(check_consensus(&[], 1, 10).is_none());
    }
}
