use std::collections::HashMap;

use crate::error::{Result, TokenizerError};

/// Ranked merge rules; lower rank merges first.
#[derive(Debug, Clone, Default)]
pub struct Merges {
    ranks: HashMap<(String, String), u32>,
}

impl Merges {
    /// Parse `"left right"` rules, ranked by position.
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut ranks = HashMap::with_capacity(rules.len());
        for (rank, rule) in rules.iter().enumerate() {
            let rule = rule.as_ref();
            let mut parts = rule.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => {
                    ranks.entry((a.to_string(), b.to_string())).or_insert(rank as u32);
                }
                _ => return Err(TokenizerError::InvalidMerge(rule.to_string())),
            }
        }
        Ok(Self { ranks })
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Split `word` into characters and apply merges until none applies.
    pub fn apply(&self, word: &str) -> Vec<String> {
        let mut parts: Vec<String> = word.chars().map(|c| c.to_string()).collect();

        while parts.len() > 1 {
            let best = parts
                .windows(2)
                .filter_map(|pair| {
                    self.ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);
            let Some((_, first, second)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(parts.len());
            let mut i = 0;
            while i < parts.len() {
                if i + 1 < parts.len() && parts[i] == first && parts[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut parts[i]));
                    i += 1;
                }
            }
            parts = merged;
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_apply_in_rank_order() {
        let merges = Merges::parse(&["l o", "lo w", "e r", "low er"]).unwrap();
        assert_eq!(merges.apply("lower"), vec!["lower"]);
        assert_eq!(merges.apply("slow"), vec!["s", "low"]);
        assert_eq!(merges.apply("x"), vec!["x"]);
        assert!(merges.apply("").is_empty());
    }

    #[test]
    fn repeated_pairs_merge_left_to_right() {
        let merges = Merges::parse(&["a a"]).unwrap();
        assert_eq!(merges.apply("aaa"), vec!["aa", "a"]);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        assert!(matches!(
            Merges::parse(&["abc"]),
            Err(TokenizerError::InvalidMerge(rule)) if rule == "abc"
        ));
        assert!(Merges::parse(&["a b c"]).is_err());
    }
}
