use std::collections::HashSet;

/// Symbol similarity used by the deactivation guard to score candidate
/// replacements for a disappearing function symbol.
///
/// `similarity(a, a) == 1.0` and `similarity(a, b) == similarity(b, a)`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    0.7 * sequence_ratio(&a, &b) + 0.3 * jaccard(&word_parts(&a), &word_parts(&b))
}

/// Python's `difflib.SequenceMatcher.ratio()`: twice the number of matching
/// characters (via longest common subsequence length, summed over the
/// matching-blocks greedy algorithm) divided by the total length of both
/// strings. We approximate with an LCS-length-based ratio, which agrees
/// with `ratio()` for the short identifier-like strings this guard scores.
fn sequence_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let total = a.chars().count() + b.chars().count();
    if total == 0 {
        return 1.0;
    }
    let matches = longest_common_subsequence(a, b);
    (2 * matches) as f64 / total as f64
}

fn longest_common_subsequence(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 0..a.len() {
        for j in 0..b.len() {
            dp[i + 1][j + 1] = if a[i] == b[j] {
                dp[i][j] + 1
            } else {
                dp[i][j + 1].max(dp[i + 1][j])
            };
        }
    }
    dp[a.len()][b.len()]
}

/// Splits a snake_case identifier on `_` into a set of non-empty parts.
pub fn word_parts(name: &str) -> HashSet<String> {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Minimum score for a candidate replacement to be surfaced.
pub const REPLACEMENT_THRESHOLD: f64 = 0.2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(similarity("greet", "greet"), 1.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        assert_eq!(similarity("greet", "hello_world"), similarity("hello_world", "greet"));
    }

    #[test]
    fn shared_word_parts_boost_score() {
        let unrelated = similarity("greet", "xyz123");
        let shared = similarity("send_email", "send_sms");
        assert!(shared > unrelated);
    }

    proptest::proptest! {
        #[test]
        fn similarity_is_always_symmetric_proptest(a in "[a-z_]{1,12}", b in "[a-z_]{1,12}") {
            let ab = similarity(&a, &b);
            let ba = similarity(&b, &a);
            proptest::prop_assert!((ab - ba).abs() < 1e-9);
        }
    }
}
