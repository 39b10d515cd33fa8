//! Property-based tests for topic pattern matching.
//!
//! Compiled patterns are checked against a straightforward recursive
//! matcher over randomly generated topics and patterns.

use proptest::prelude::*;
use rivulet_runtime::{PatternError, TopicPattern};

/// Recursive matcher over already split levels.
fn reference_match(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.split_first(), topic.split_first()) {
        (Some((&"#", rest)), _) if rest.is_empty() => true,
        (Some((&"+", prest)), Some((t, trest))) => !t.is_empty() && reference_match(prest, trest),
        (Some((p, prest)), Some((t, trest))) => p == t && reference_match(prest, trest),
        (None, None) => true,
        _ => false,
    }
}

fn arb_level() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a".to_string()),
        Just("b".to_string()),
        Just("dev-1".to_string()),
        Just(String::new()),
    ]
}

fn arb_topic() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_level(), 1..6).prop_map(|levels| levels.join("/"))
}

/// Valid patterns: exact and `+` levels, optionally ending in `#`.
fn arb_pattern() -> impl Strategy<Value = String> {
    let level = prop_oneof![
        3 => arb_level(),
        2 => Just("+".to_string()),
    ];
    (prop::collection::vec(level, 0..5), any::<bool>()).prop_filter_map(
        "pattern must not be empty",
        |(mut levels, multi)| {
            if multi {
                levels.push("#".to_string());
            }
            let pattern = levels.join("/");
            (!pattern.is_empty()).then_some(pattern)
        },
    )
}

proptest! {
    /// Compiled patterns agree with the reference matcher.
    #[test]
    fn matches_agree_with_reference(pattern in arb_pattern(), topic in arb_topic()) {
        let compiled = TopicPattern::compile(&pattern).unwrap();
        let p: Vec<&str> = pattern.split('/').collect();
        let t: Vec<&str> = topic.split('/').collect();
        prop_assert_eq!(
            compiled.matches(&topic),
            reference_match(&p, &t),
            "pattern {} topic {}", pattern, topic
        );
    }

    /// A pattern without wildcards matches exactly its own text.
    #[test]
    fn literal_pattern_matches_only_itself(a in arb_topic(), b in arb_topic()) {
        prop_assume!(!a.is_empty());
        let compiled = TopicPattern::compile(&a).unwrap();
        prop_assert!(compiled.matches(&a));
        prop_assert_eq!(compiled.matches(&b), a == b);
    }

    /// `prefix/#` matches the prefix itself and everything below it.
    #[test]
    fn multi_level_covers_subtree(prefix in arb_topic(), suffix in arb_topic()) {
        prop_assume!(!prefix.is_empty());
        let compiled = TopicPattern::compile(&format!("{}/#", prefix)).unwrap();
        prop_assert!(compiled.matches(&prefix));
        let below = format!("{}/{}", prefix, suffix);
        prop_assert!(compiled.matches(&below));
    }

    /// `#` anywhere but the last level is rejected.
    #[test]
    fn misplaced_multi_level_is_rejected(head in arb_topic(), tail in arb_topic()) {
        let pattern = format!("{}/#/{}", head, tail);
        prop_assert_eq!(
            TopicPattern::compile(&pattern),
            Err(PatternError::MultiLevelNotLast { pattern: pattern.clone() })
        );
    }

    /// A `+` glued to other text in a level is rejected.
    #[test]
    fn partial_single_level_is_rejected(head in arb_topic(), word in "[a-z]{1,5}") {
        let pattern = format!("{}/{}+", head, word);
        prop_assert_eq!(
            TopicPattern::compile(&pattern),
            Err(PatternError::PartialLevelWildcard { pattern: pattern.clone(), wildcard: '+' })
        );
    }
}

#[test]
fn hash_alone_matches_everything() {
    let all = TopicPattern::compile("#").unwrap();
    for topic in ["a", "a/b", "", "x//y"] {
        assert!(all.matches(topic), "{}", topic);
    }
}

#[test]
fn empty_pattern_is_rejected() {
    assert_eq!(TopicPattern::compile(""), Err(PatternError::Empty));
}
