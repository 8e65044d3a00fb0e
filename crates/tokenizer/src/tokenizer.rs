use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bpe::Merges;
use crate::error::{Result, TokenizerError};
use crate::hf::{is_hf_layout, HfDocument};
use crate::vocab::Vocab;

/// Stands in for a space inside vocabulary tokens.
pub const SPACE_MARKER: char = '\u{2581}';

const PRETOKENIZE: &str = r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// On-disk `tokenizer.json` document.
///
/// Written in a flat layout; [`TokenizerFile::from_json_str`] also reads the
/// Hugging Face layout found in model exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenizerFile {
    pub vocab: HashMap<String, u32>,
    #[serde(default)]
    pub merges: Vec<String>,
    #[serde(default)]
    pub special_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_turn_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unk_token: Option<String>,
}

impl TokenizerFile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if is_hf_layout(&value) {
            serde_json::from_value::<HfDocument>(value)?.into_file()
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Byte-pair tokenizer with special tokens and `<0xNN>` byte fallback.
#[derive(Clone)]
pub struct Tokenizer {
    vocab: Vocab,
    merges: Merges,
    pattern: Regex,
    special_pattern: Option<Regex>,
    special_ids: HashSet<u32>,
    byte_tokens: HashMap<u32, u8>,
    byte_ids: [Option<u32>; 256],
    bos: Option<u32>,
    eos: Option<u32>,
    end_of_turn: Option<u32>,
    unk: Option<u32>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("merges", &self.merges.len())
            .field("special", &self.special_ids.len())
            .finish()
    }
}

fn byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl Tokenizer {
    pub fn new(file: TokenizerFile) -> Result<Self> {
        let vocab = Vocab::from_map(file.vocab)?;
        let merges = Merges::parse(&file.merges)?;

        let lookup = |token: &Option<String>| -> Result<Option<u32>> {
            token
                .as_deref()
                .map(|t| {
                    vocab
                        .get_id(t)
                        .ok_or_else(|| TokenizerError::UnknownSpecialToken(t.to_string()))
                })
                .transpose()
        };
        let bos = lookup(&file.bos_token)?;
        let eos = lookup(&file.eos_token)?;
        let end_of_turn = lookup(&file.end_of_turn_token)?;
        let unk = lookup(&file.unk_token)?;

        let mut specials: Vec<String> = file.special_tokens;
        for token in [&file.bos_token, &file.eos_token, &file.end_of_turn_token, &file.unk_token]
            .into_iter()
            .flatten()
        {
            if !specials.contains(token) {
                specials.push(token.clone());
            }
        }
        let mut special_ids = HashSet::with_capacity(specials.len());
        for token in &specials {
            let id = vocab
                .get_id(token)
                .ok_or_else(|| TokenizerError::UnknownSpecialToken(token.clone()))?;
            special_ids.insert(id);
        }
        // Longest first so overlapping specials match greedily.
        specials.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let special_pattern = if specials.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = specials.iter().map(|t| regex::escape(t)).collect();
            Some(Regex::new(&alternatives.join("|"))?)
        };

        let mut byte_tokens = HashMap::new();
        let mut byte_ids = [None; 256];
        for (token, id) in vocab.iter() {
            if let Some(byte) = byte_token(token) {
                byte_tokens.insert(id, byte);
                byte_ids[byte as usize] = Some(id);
            }
        }

        info!(
            vocab = vocab.len(),
            merges = merges.len(),
            special = special_ids.len(),
            byte_fallback = byte_tokens.len(),
            "tokenizer loaded"
        );
        Ok(Self {
            vocab,
            merges,
            pattern: Regex::new(PRETOKENIZE)?,
            special_pattern,
            special_ids,
            byte_tokens,
            byte_ids,
            bos,
            eos,
            end_of_turn,
            unk,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::new(TokenizerFile::from_json_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// One past the largest token id.
    pub fn vocab_size(&self) -> usize {
        self.vocab.id_bound()
    }

    pub fn bos_id(&self) -> Option<u32> {
        self.bos
    }

    pub fn eos_id(&self) -> Option<u32> {
        self.eos
    }

    pub fn end_of_turn_id(&self) -> Option<u32> {
        self.end_of_turn
    }

    /// Ids that end an assistant turn.
    pub fn stop_ids(&self) -> Vec<u32> {
        self.eos.into_iter().chain(self.end_of_turn).collect()
    }

    pub fn is_special(&self, id: u32) -> bool {
        self.special_ids.contains(&id)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get_id(token)
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.vocab.get_token(id)
    }

    /// Encode `text`; special token strings in it map to their ids.
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let mut ids = Vec::new();
        if add_bos {
            ids.extend(self.bos);
        }
        let mut rest = 0;
        if let Some(special) = &self.special_pattern {
            for m in special.find_iter(text) {
                self.encode_ordinary(&text[rest..m.start()], &mut ids);
                ids.extend(self.vocab.get_id(m.as_str()));
                rest = m.end();
            }
        }
        self.encode_ordinary(&text[rest..], &mut ids);
        ids
    }

    fn encode_ordinary(&self, text: &str, ids: &mut Vec<u32>) {
        for piece in self.pattern.find_iter(text) {
            let word = piece.as_str().replace(' ', &SPACE_MARKER.to_string());
            for part in self.merges.apply(&word) {
                match self.vocab.get_id(&part) {
                    Some(id) => ids.push(id),
                    None => part.chars().for_each(|c| self.encode_char(c, ids)),
                }
            }
        }
    }

    fn encode_char(&self, c: char, ids: &mut Vec<u32>) {
        let mut buf = [0u8; 4];
        let s = c.encode_utf8(&mut buf);
        if let Some(id) = self.vocab.get_id(s) {
            ids.push(id);
            return;
        }
        for byte in s.bytes() {
            match self.byte_ids[byte as usize].or(self.unk) {
                Some(id) => ids.push(id),
                None => debug!(byte, "dropping byte without a fallback token"),
            }
        }
    }

    /// Raw bytes a token contributes to decoded text.
    pub fn token_bytes(&self, id: u32) -> Result<Vec<u8>> {
        if let Some(&byte) = self.byte_tokens.get(&id) {
            return Ok(vec![byte]);
        }
        let token = self.vocab.get_token(id).ok_or(TokenizerError::UnknownId(id))?;
        Ok(token.replace(SPACE_MARKER, " ").into_bytes())
    }

    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if skip_special && self.is_special(id) {
                continue;
            }
            bytes.extend(self.token_bytes(id)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
