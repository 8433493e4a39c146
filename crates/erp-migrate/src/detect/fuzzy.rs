//! Fuzzy name matching.
//!
//! Names are normalized first (case, punctuation, optional legal suffixes and
//! honorifics), then compared as token sets. Pairs that do not share their
//! whole token set fall back to edit-distance similarity (Jaro-Winkler and
//! normalized Levenshtein from `strsim`).

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, normalized_levenshtein};

/// Company suffixes ignored when `strip_suffixes` is set.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "ltd", "limited", "corp", "corporation", "co", "gmbh", "plc",
    "sa", "ag", "bv",
];

/// Honorifics ignored when `strip_honorifics` is set.
const HONORIFICS: &[&str] = &["mr", "mrs", "ms", "miss", "dr", "prof", "sir"];

/// Characters of each token used by the batch shortlist index.
const SHORTLIST_PREFIX_LEN: usize = 2;

/// Configuration for fuzzy name matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyMatchConfig {
    /// Drop legal suffixes ("Inc", "LLC", ...).
    pub strip_suffixes: bool,
    /// Drop honorifics ("Mr", "Dr", ...).
    pub strip_honorifics: bool,
    /// Weight of Jaro-Winkler in the edit-distance fallback (0.0 to 1.0).
    pub jaro_winkler_weight: f64,
    /// Minimum similarity for a fuzzy pair to count as a match (0.0 to 1.0).
    pub min_similarity: f64,
}

impl Default for FuzzyMatchConfig {
    fn default() -> Self {
        Self {
            strip_suffixes: true,
            strip_honorifics: true,
            jaro_winkler_weight: 0.5,
            min_similarity: 0.75,
        }
    }
}

/// A normalization that changed at least one of the compared names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Lowercase,
    StripPunctuation,
    CollapseWhitespace,
    StripSuffixes,
    StripHonorifics,
}

/// How a similarity score was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Raw strings are equal.
    Identical,
    /// Equal after normalization.
    Normalized,
    /// Same tokens in another order, or a partial token overlap.
    TokenSet,
    /// Edit-distance fallback.
    EditDistance,
}

/// Result of comparing two names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatchResult {
    /// Similarity in `[0.0, 1.0]`.
    pub score: f64,
    pub method: MatchMethod,
    /// Normalizations that changed either input, in application order.
    pub normalizations: Vec<Normalization>,
    pub left: String,
    pub right: String,
}

impl FuzzyMatchResult {
    /// Whether the score clears the configured minimum.
    pub fn is_match(&self, config: &FuzzyMatchConfig) -> bool {
        self.score >= config.min_similarity
    }
}

struct NormalizedName {
    text: String,
    applied: BTreeSet<Normalization>,
}

fn normalize(raw: &str, config: &FuzzyMatchConfig) -> NormalizedName {
    let mut applied = BTreeSet::new();

    let lowered = raw.to_lowercase();
    if lowered != raw {
        applied.insert(Normalization::Lowercase);
    }

    let depunct: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    if depunct != lowered {
        applied.insert(Normalization::StripPunctuation);
    }

    let mut tokens: Vec<&str> = depunct.split_whitespace().collect();
    if tokens.join(" ") != depunct {
        applied.insert(Normalization::CollapseWhitespace);
    }

    if config.strip_honorifics && tokens.len() > 1 && HONORIFICS.contains(&tokens[0]) {
        tokens.remove(0);
        applied.insert(Normalization::StripHonorifics);
    }
    if config.strip_suffixes {
        while tokens.len() > 1 && tokens.last().is_some_and(|t| LEGAL_SUFFIXES.contains(t)) {
            tokens.pop();
            applied.insert(Normalization::StripSuffixes);
        }
    }

    NormalizedName {
        text: tokens.join(" "),
        applied,
    }
}

fn token_set(text: &str) -> BTreeSet<&str> {
    text.split_whitespace().collect()
}

/// Compare two names and report the similarity and the normalization applied.
pub fn fuzzy_match_name(a: &str, b: &str, config: &FuzzyMatchConfig) -> FuzzyMatchResult {
    let left = normalize(a, config);
    let right = normalize(b, config);
    let normalizations: Vec<Normalization> = left.applied.union(&right.applied).copied().collect();

    let result = |score: f64, method: MatchMethod| FuzzyMatchResult {
        score,
        method,
        normalizations: normalizations.clone(),
        left: left.text.clone(),
        right: right.text.clone(),
    };

    if left.text.is_empty() || right.text.is_empty() {
        return result(0.0, MatchMethod::EditDistance);
    }
    if a == b {
        return FuzzyMatchResult {
            normalizations: Vec::new(),
            ..result(1.0, MatchMethod::Identical)
        };
    }
    if left.text == right.text {
        return result(1.0, MatchMethod::Normalized);
    }

    let left_tokens = token_set(&left.text);
    let right_tokens = token_set(&right.text);
    let shared = left_tokens.intersection(&right_tokens).count();
    let union = left_tokens.union(&right_tokens).count();
    let token_score = if union == 0 { 0.0 } else { shared as f64 / union as f64 };
    if token_score >= 1.0 {
        return result(1.0, MatchMethod::TokenSet);
    }

    // Sorted tokens make reordered names comparable character by character.
    let left_sorted = left_tokens.iter().copied().collect::<Vec<_>>().join(" ");
    let right_sorted = right_tokens.iter().copied().collect::<Vec<_>>().join(" ");
    let jw_weight = config.jaro_winkler_weight.clamp(0.0, 1.0);
    let edit_score = jw_weight * jaro_winkler(&left_sorted, &right_sorted)
        + (1.0 - jw_weight) * normalized_levenshtein(&left_sorted, &right_sorted);

    if token_score >= edit_score {
        result(token_score, MatchMethod::TokenSet)
    } else {
        result(edit_score, MatchMethod::EditDistance)
    }
}

/// Match one name against many candidates.
///
/// Candidates are first shortlisted through an index of token prefixes, so
/// only candidates sharing at least one token prefix with `query` are scored.
/// Returns `(candidate index, result)` for matches at or above
/// `config.min_similarity`, best first; ties keep candidate order.
pub fn batch_fuzzy_match_names<S: AsRef<str>>(
    query: &str,
    candidates: &[S],
    config: &FuzzyMatchConfig,
) -> Vec<(usize, FuzzyMatchResult)> {
    let query_norm = normalize(query, config);
    if query_norm.text.is_empty() {
        return Vec::new();
    }

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let norm = normalize(candidate.as_ref(), config);
        let prefixes: HashSet<String> = norm.text.split_whitespace().map(token_prefix).collect();
        for prefix in prefixes {
            index.entry(prefix).or_default().push(i);
        }
    }

    let mut shortlist: BTreeSet<usize> = BTreeSet::new();
    for token in query_norm.text.split_whitespace() {
        if let Some(ids) = index.get(&token_prefix(token)) {
            shortlist.extend(ids.iter().copied());
        }
    }

    let mut matches: Vec<(usize, FuzzyMatchResult)> = shortlist
        .into_iter()
        .map(|i| (i, fuzzy_match_name(query, candidates[i].as_ref(), config)))
        .filter(|(_, r)| r.is_match(config))
        .collect();
    matches.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
    matches
}

fn token_prefix(token: &str) -> String {
    token.chars().take(SHORTLIST_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_names() {
        let r = fuzzy_match_name("Jon Smith", "Jon Smith", &FuzzyMatchConfig::default());
        assert_eq!(r.score, 1.0);
        assert_eq!(r.method, MatchMethod::Identical);
        assert!(r.normalizations.is_empty());
    }

    #[test]
    fn test_case_and_punctuation_normalized() {
        let r = fuzzy_match_name("ACME, Inc.", "acme", &FuzzyMatchConfig::default());
        assert_eq!(r.score, 1.0);
        assert_eq!(r.method, MatchMethod::Normalized);
        assert!(r.normalizations.contains(&Normalization::Lowercase));
        assert!(r.normalizations.contains(&Normalization::StripPunctuation));
        assert!(r.normalizations.contains(&Normalization::StripSuffixes));
    }

    #[test]
    fn test_suffix_kept_when_disabled() {
        let config = FuzzyMatchConfig {
            strip_suffixes: false,
            ..Default::default()
        };
        let r = fuzzy_match_name("Acme Inc", "Acme", &config);
        assert!(r.score < 1.0);
        assert!(!r.normalizations.contains(&Normalization::StripSuffixes));
    }

    #[test]
    fn test_reordered_tokens() {
        let r = fuzzy_match_name("Smith Jon", "Jon Smith", &FuzzyMatchConfig::default());
        assert_eq!(r.score, 1.0);
        assert_eq!(r.method, MatchMethod::TokenSet);
    }

    #[test]
    fn test_typo_falls_back_to_edit_distance() {
        let r = fuzzy_match_name("Jonathan Smith", "Jonathon Smith", &FuzzyMatchConfig::default());
        assert_eq!(r.method, MatchMethod::EditDistance);
        assert!(r.score > 0.9, "score {}", r.score);
    }

    #[test]
    fn test_unrelated_names_score_low() {
        let r = fuzzy_match_name("Jon Smith", "Maria Garcia", &FuzzyMatchConfig::default());
        assert!(r.score < 0.5, "score {}", r.score);
        assert!(!r.is_match(&FuzzyMatchConfig::default()));
    }

    #[test]
    fn test_honorific_stripped() {
        let r = fuzzy_match_name("Dr. Jane Doe", "Jane Doe", &FuzzyMatchConfig::default());
        assert_eq!(r.score, 1.0);
        assert!(r.normalizations.contains(&Normalization::StripHonorifics));
    }

    #[test]
    fn test_empty_name_never_matches() {
        let r = fuzzy_match_name("", "Jane", &FuzzyMatchConfig::default());
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn test_two_empty_names_do_not_match() {
        let config = FuzzyMatchConfig::default();
        for (a, b) in [("", ""), ("  ", "  "), ("", " ")] {
            let r = fuzzy_match_name(a, b, &config);
            assert_eq!(r.score, 0.0, "{:?} vs {:?}", a, b);
            assert_ne!(r.method, MatchMethod::Identical);
        }
    }

    #[test]
    fn test_batch_shortlists_and_orders() {
        let candidates = ["Maria Garcia", "Jon Smith", "Jonathan Smyth", "Zed Zulu", "Smith Jon"];
        let matches = batch_fuzzy_match_names("Jon Smith", &candidates, &FuzzyMatchConfig::default());
        let ids: Vec<usize> = matches.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids[0], 1);
        assert_eq!(ids[1], 4);
        assert!(!ids.contains(&0));
        assert!(!ids.contains(&3));
    }

    #[test]
    fn test_batch_skips_candidates_without_shared_prefix() {
        // Close by edit distance, but no token prefix in common.
        let candidates = ["Xon Xmith"];
        let matches = batch_fuzzy_match_names("Jon Smith", &candidates, &FuzzyMatchConfig::default());
        assert!(matches.is_empty());
    }
}
