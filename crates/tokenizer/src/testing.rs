//! A chat vocabulary small enough for the tiny test models.

use std::collections::HashMap;

use crate::tokenizer::{TokenizerFile, SPACE_MARKER};

/// Special tokens for both chat layouts, lowercase letters, a little
/// punctuation and a handful of merges. Ids stay below 48.
pub fn chat_file() -> TokenizerFile {
    let mut vocab: HashMap<String, u32> = HashMap::new();
    let mut add = |t: String| {
        let id = vocab.len() as u32;
        vocab.entry(t).or_insert(id);
    };
    for t in [
        "<pad>",
        "<eos>",
        "<bos>",
        "<start_of_turn>",
        "<end_of_turn>",
        "<unk>",
        "<|im_start|>",
        "<|im_end|>",
        "\n",
    ] {
        add(t.to_string());
    }
    add(SPACE_MARKER.to_string());
    for c in 'a'..='z' {
        add(c.to_string());
    }
    for t in ["!", "?", ".", ",", ":", "-", "'"] {
        add(t.to_string());
    }
    for t in ["he", "ll", "hell", "hello", "\u{2581}w"] {
        add(t.to_string());
    }

    TokenizerFile {
        vocab,
        merges: ["h e", "l l", "he ll", "hell o", "\u{2581} w"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        special_tokens: ["<pad>", "<start_of_turn>", "<|im_start|>", "<|im_end|>"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        bos_token: Some("<bos>".to_string()),
        eos_token: Some("<eos>".to_string()),
        end_of_turn_token: Some("<end_of_turn>".to_string()),
        unk_token: Some("<unk>".to_string()),
    }
}
