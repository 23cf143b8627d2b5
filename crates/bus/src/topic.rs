//! Topic binding patterns.
//!
//! `*` matches exactly one segment; `#` matches zero or more segments.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use loomerp_core::DomainError;

use crate::event::RoutingKey;

/// A queue binding pattern over `.`-delimited routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingPattern(String);

impl BindingPattern {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, key: &RoutingKey) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let segments: Vec<&str> = key.segments().collect();
        matches_segments(&pattern, &segments)
    }
}

impl FromStr for BindingPattern {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.split('.').any(|seg| seg.is_empty()) {
            return Err(DomainError::validation(format!(
                "binding pattern '{s}' has an empty segment"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl core::fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs zero segments, or one and stays greedy.
            matches_segments(rest, key)
                || (!key.is_empty() && matches_segments(pattern, &key[1..]))
        }
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => matches_segments(rest, key_rest),
            None => false,
        },
        Some((seg, rest)) => match key.split_first() {
            Some((k, key_rest)) => seg == k && matches_segments(rest, key_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &str) -> RoutingKey {
        s.parse().unwrap()
    }

    fn pattern(s: &str) -> BindingPattern {
        s.parse().unwrap()
    }

    #[test]
    fn exact_match() {
        assert!(pattern("pos.sale.closed").matches(&key("pos.sale.closed")));
        assert!(!pattern("pos.sale.closed").matches(&key("pos.sale.opened")));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(pattern("pos.*.closed").matches(&key("pos.sale.closed")));
        assert!(!pattern("pos.*").matches(&key("pos.sale.closed")));
        assert!(pattern("stock.update.*").matches(&key("stock.update.failed")));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(pattern("#").matches(&key("pos.sale.closed")));
        assert!(pattern("pos.#").matches(&key("pos.sale")));
        assert!(pattern("pos.#").matches(&key("pos.sale.closed")));
        assert!(pattern("pos.#.closed").matches(&key("pos.closed")));
        assert!(pattern("pos.#.closed").matches(&key("pos.sale.retail.closed")));
        assert!(!pattern("pos.#.closed").matches(&key("inventory.stock.closed")));
    }

    #[test]
    fn pattern_validation() {
        assert!("pos..closed".parse::<BindingPattern>().is_err());
        assert!("".parse::<BindingPattern>().is_err());
        assert!("#".parse::<BindingPattern>().is_ok());
    }

    proptest! {
        #[test]
        fn hash_alone_matches_every_key(a in "[a-z]{1,8}", b in "[a-z]{1,8}", c in "[a-z]{1,8}") {
            let key = format!("{a}.{b}.{c}").parse::<RoutingKey>().unwrap();
            prop_assert!(pattern("#").matches(&key));
        }

        #[test]
        fn exact_pattern_only_matches_itself(a in "[a-z]{1,8}", b in "[a-z]{1,8}", other in "[a-z]{1,8}") {
            let exact = pattern(&format!("{a}.{b}"));
            let key_ab = key(&format!("{a}.{b}"));
            prop_assert!(exact.matches(&key_ab));
            if other != b {
                let key_aother = key(&format!("{a}.{other}"));
                prop_assert!(!exact.matches(&key_aother));
            }
        }
    }
}
