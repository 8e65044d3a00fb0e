use std::collections::HashMap;

use crate::error::{Result, TokenizerError};

/// Bidirectional token string / id mapping.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `token -> id` map, rejecting ids used twice.
    pub fn from_map(token_to_id: HashMap<String, u32>) -> Result<Self> {
        let mut id_to_token = HashMap::with_capacity(token_to_id.len());
        for (token, &id) in &token_to_id {
            if id_to_token.insert(id, token.clone()).is_some() {
                return Err(TokenizerError::DuplicateId(id));
            }
        }
        Ok(Self {
            token_to_id,
            id_to_token,
        })
    }

    pub fn insert(&mut self, token: String, id: u32) {
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.insert(id, token);
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    /// One past the largest id.
    pub fn id_bound(&self) -> usize {
        self.id_to_token.keys().max().map_or(0, |&id| id as usize + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.token_to_id.iter().map(|(t, &id)| (t.as_str(), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_go_both_ways() {
        let vocab = Vocab::from_map(HashMap::from([("a".to_string(), 0), ("bc".to_string(), 5)])).unwrap();
        assert_eq!(vocab.get_id("bc"), Some(5));
        assert_eq!(vocab.get_token(0), Some("a"));
        assert_eq!(vocab.get_token(1), None);
        assert_eq!(vocab.id_bound(), 6);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let map = HashMap::from([("a".to_string(), 3), ("b".to_string(), 3)]);
        assert!(matches!(Vocab::from_map(map), Err(TokenizerError::DuplicateId(3))));
    }
}
