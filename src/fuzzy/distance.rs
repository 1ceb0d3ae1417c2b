//! Edit distance helpers.

use std::ops::ControlFlow;

/// Plain Levenshtein distance over chars.
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Similarity in `[0, 1]` derived from edit distance.
pub fn similarity(distance: usize, a_len: usize, b_len: usize) -> f64 {
    let longest = a_len.max(b_len);
    if longest == 0 {
        return 1.0;
    }
    1.0 - distance as f64 / longest as f64
}

/// Distances from `target` to every prefix of `window`.
///
/// Calls `visit(prefix_len, distance)` for each prefix length from 1 up,
/// and stops once no longer prefix can come within `max_distance` (the
/// minimum of a DP row never decreases from one row to the next) or when
/// `visit` breaks. Each call costs one DP row of `target.len()` cells.
pub fn prefix_distances(
    target: &[char],
    window: &[char],
    max_distance: usize,
    mut visit: impl FnMut(usize, usize) -> ControlFlow<()>,
) {
    let m = target.len();
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0; m + 1];

    for (j, &wc) in window.iter().enumerate() {
        cur[0] = j + 1;
        let mut row_min = cur[0];
        for i in 1..=m {
            let sub = prev[i - 1] + usize::from(target[i - 1] != wc);
            let v = sub.min(prev[i] + 1).min(cur[i - 1] + 1);
            cur[i] = v;
            row_min = row_min.min(v);
        }
        if visit(j + 1, cur[m]).is_break() || row_min > max_distance {
            break;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein(&chars(""), &chars("abc")), 3);
        assert_eq!(levenshtein(&chars("same"), &chars("same")), 0);
    }

    #[test]
    fn test_prefix_distances_agree_with_levenshtein() {
        let target = chars("retrun x");
        let window = chars("return x;\n}");
        let mut seen = Vec::new();
        prefix_distances(&target, &window, usize::MAX, |len, d| {
            seen.push((len, d));
            ControlFlow::Continue(())
        });
        assert_eq!(seen.len(), window.len());
        for (len, d) in seen {
            assert_eq!(d, levenshtein(&target, &window[..len]));
        }
    }

    #[test]
    fn test_prefix_distances_stops_early() {
        let target = chars("abc");
        let window = chars("xyzxyzxyz");
        let mut visited = 0;
        prefix_distances(&target, &window, 0, |_, _| {
            visited += 1;
            ControlFlow::Continue(())
        });
        assert!(visited < window.len());
    }

    #[test]
    fn test_prefix_distances_stops_when_visitor_breaks() {
        let target = chars("abc");
        let window = chars("abcabcabc");
        let mut visited = 0;
        prefix_distances(&target, &window, usize::MAX, |_, _| {
            visited += 1;
            if visited == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity(0, 0, 0), 1.0);
        assert_eq!(similarity(0, 4, 4), 1.0);
        assert_eq!(similarity(4, 4, 4), 0.0);
        assert!((similarity(1, 4, 5) - 0.8).abs() < 1e-9);
    }
}
