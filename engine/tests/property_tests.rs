//! Property-based tests for the subscription pattern matcher
//!
//! The matcher is compiled per segment, so these properties must hold for
//! arbitrary dotted names, not just the handful of examples in the unit
//! tests.

use pelorus_engine::subscriptions::PathPattern;
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9]{0,7}".prop_map(|s| s)
}

fn dotted_path(max_segments: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(segment(), 1..=max_segments)
}

proptest! {
    #[test]
    fn literal_pattern_matches_exactly_itself(segments in dotted_path(6)) {
        let path = segments.join(".");
        let pattern = PathPattern::compile(&path).unwrap();
        prop_assert!(pattern.matches(&path));
    }

    #[test]
    fn wildcarding_any_single_segment_still_matches(
        segments in dotted_path(6),
        index in 0usize..6,
    ) {
        let index = index % segments.len();
        let path = segments.join(".");

        let mut wild = segments.clone();
        wild[index] = "*".to_string();
        let pattern = PathPattern::compile(&wild.join(".")).unwrap();
        prop_assert!(pattern.matches(&path), "pattern {} vs {}", wild.join("."), path);
    }

    #[test]
    fn segment_count_mismatch_never_matches(
        segments in dotted_path(5),
        extra in segment(),
    ) {
        let pattern = PathPattern::compile(&segments.join(".")).unwrap();

        let mut longer = segments.clone();
        longer.push(extra);
        prop_assert!(!pattern.matches(&longer.join(".")));

        if segments.len() > 1 {
            let shorter = segments[..segments.len() - 1].join(".");
            prop_assert!(!pattern.matches(&shorter));
        }
    }

    #[test]
    fn all_wildcards_match_any_path_of_same_length(segments in dotted_path(5)) {
        let stars = vec!["*"; segments.len()].join(".");
        let pattern = PathPattern::compile(&stars).unwrap();
        prop_assert!(pattern.matches(&segments.join(".")));
    }

    #[test]
    fn changed_literal_segment_never_matches(segments in dotted_path(5), index in 0usize..5) {
        let index = index % segments.len();
        let pattern = PathPattern::compile(&segments.join(".")).unwrap();

        let mut other = segments.clone();
        other[index] = format!("{}x", other[index]);
        prop_assert!(!pattern.matches(&other.join(".")));
    }
}
