//! Reading the Hugging Face `tokenizer.json` layout that model exports ship:
//! `model.vocab`, `model.merges` and the `added_tokens` list.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, TokenizerError};
use crate::tokenizer::TokenizerFile;

const BOS_NAMES: &[&str] = &["<bos>", "<s>", "<|begin_of_text|>"];
const EOS_NAMES: &[&str] = &["<eos>", "</s>", "<|end_of_text|>", "<|endoftext|>"];
const END_OF_TURN_NAMES: &[&str] = &["<end_of_turn>", "<|eot_id|>", "<|im_end|>"];

#[derive(Debug, Deserialize)]
pub(crate) struct HfDocument {
    model: HfModel,
    #[serde(default)]
    added_tokens: Vec<AddedToken>,
}

#[derive(Debug, Deserialize)]
struct HfModel {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    vocab: HashMap<String, u32>,
    #[serde(default)]
    merges: Vec<Merge>,
    #[serde(default)]
    unk_token: Option<String>,
}

/// Older exports join a rule with a space, newer ones store the pair.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Merge {
    Joined(String),
    Pair([String; 2]),
}

impl Merge {
    fn into_rule(self) -> Result<String> {
        match self {
            Merge::Joined(rule) => Ok(rule),
            Merge::Pair([a, b]) if a.contains(' ') || b.contains(' ') => {
                Err(TokenizerError::InvalidMerge(format!("{a} {b}")))
            }
            Merge::Pair([a, b]) => Ok(format!("{a} {b}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddedToken {
    id: u32,
    content: String,
    #[serde(default)]
    special: bool,
}

/// Whether `value` looks like the Hugging Face layout rather than the flat one.
pub(crate) fn is_hf_layout(value: &serde_json::Value) -> bool {
    value.get("model").is_some_and(|m| m.is_object())
}

fn first_present(vocab: &HashMap<String, u32>, names: &[&str]) -> Option<String> {
    names.iter().find(|n| vocab.contains_key(**n)).map(|n| n.to_string())
}

impl HfDocument {
    pub(crate) fn into_file(self) -> Result<TokenizerFile> {
        let HfModel {
            kind,
            mut vocab,
            merges,
            unk_token,
        } = self.model;
        if let Some(kind) = kind.filter(|k| k != "BPE") {
            return Err(TokenizerError::UnsupportedModel(kind));
        }

        let mut special_tokens = Vec::new();
        for token in self.added_tokens {
            vocab.entry(token.content.clone()).or_insert(token.id);
            if token.special {
                special_tokens.push(token.content);
            }
        }
        let merges = merges
            .into_iter()
            .map(Merge::into_rule)
            .collect::<Result<Vec<_>>>()?;

        let file = TokenizerFile {
            bos_token: first_present(&vocab, BOS_NAMES),
            eos_token: first_present(&vocab, EOS_NAMES),
            end_of_turn_token: first_present(&vocab, END_OF_TURN_NAMES),
            unk_token: unk_token.or_else(|| first_present(&vocab, &["<unk>"])),
            vocab,
            merges,
            special_tokens,
        };
        debug!(
            bos = ?file.bos_token,
            eos = ?file.eos_token,
            end_of_turn = ?file.end_of_turn_token,
            "read Hugging Face tokenizer layout"
        );
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tokenizer;

    const DOCUMENT: &str = r#"{
        "version": "1.0",
        "added_tokens": [
            {"id": 0, "content": "<unk>", "special": true},
            {"id": 1, "content": "<s>", "special": true},
            {"id": 2, "content": "</s>", "special": true},
            {"id": 9, "content": "<start_of_turn>", "special": true},
            {"id": 10, "content": "<end_of_turn>", "special": true}
        ],
        "normalizer": null,
        "model": {
            "type": "BPE",
            "unk_token": "<unk>",
            "byte_fallback": true,
            "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "h": 3, "e": 4, "he": 5, "y": 6, "hey": 7, "<0x0A>": 8},
            "merges": ["h e", "he y"]
        }
    }"#;

    #[test]
    fn reads_vocab_merges_and_added_tokens() {
        let tok = Tokenizer::from_json_str(DOCUMENT).unwrap();
        assert_eq!(tok.bos_id(), Some(1));
        assert_eq!(tok.eos_id(), Some(2));
        assert_eq!(tok.end_of_turn_id(), Some(10));
        assert_eq!(tok.vocab_size(), 11);
        assert!(tok.is_special(9));

        let ids = tok.encode("<start_of_turn>hey\n<end_of_turn>", true);
        assert_eq!(ids, vec![1, 9, 7, 8, 10]);
        assert_eq!(tok.decode(&ids, true).unwrap(), "hey\n");
    }

    #[test]
    fn merges_may_be_stored_as_pairs() {
        let document = DOCUMENT.replace(r#"["h e", "he y"]"#, r#"[["h", "e"], ["he", "y"]]"#);
        let tok = Tokenizer::from_json_str(&document).unwrap();
        assert_eq!(tok.encode("hey", false), vec![7]);
    }

    #[test]
    fn other_model_types_are_rejected() {
        let document = r#"{"model": {"type": "WordPiece", "vocab": {"a": 0}}}"#;
        assert!(matches!(
            TokenizerFile::from_json_str(document),
            Err(TokenizerError::UnsupportedModel(kind)) if kind == "WordPiece"
        ));
    }

    #[test]
    fn flat_layout_still_reads() {
        let file = crate::tokenizer::tests::sample_file();
        let parsed = TokenizerFile::from_json_str(&file.to_json().unwrap()).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn loads_an_exported_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, DOCUMENT).unwrap();
        let tok = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tok.encode("hey", false), vec![7]);
    }
}
