//! CLIP byte-level BPE tokenizer.
//!
//! Reads the `vocab.json` / `merges.txt` pair shipped with every CLIP
//! checkpoint and produces the fixed 77-token `input_ids` row expected by the
//! text encoder.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// CLIP's text context length.
pub const CONTEXT_LENGTH: usize = 77;

const START_TOKEN: &str = "<|startoftext|>";
const END_TOKEN: &str = "<|endoftext|>";
const WORD_END: &str = "</w>";

const TOKEN_PATTERN: &str =
    r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|\p{L}+|\p{N}|[^\s\p{L}\p{N}]+";

pub struct ClipTokenizer {
    encoder: HashMap<String, i64>,
    merge_ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    pattern: Regex,
    start_id: i64,
    end_id: i64,
}

impl ClipTokenizer {
    pub fn from_files(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        let vocab = std::fs::read_to_string(vocab_path)
            .with_context(|| format!("Failed to read {}", vocab_path.display()))?;
        let merges = std::fs::read_to_string(merges_path)
            .with_context(|| format!("Failed to read {}", merges_path.display()))?;
        Self::from_parts(&vocab, &merges)
    }

    /// Build from the raw contents of `vocab.json` and `merges.txt`.
    pub fn from_parts(vocab_json: &str, merges_txt: &str) -> Result<Self> {
        let encoder: HashMap<String, i64> =
            serde_json::from_str(vocab_json).context("vocab.json is not a token map")?;

        let mut merge_ranks = HashMap::new();
        for line in merges_txt.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("#version") {
                continue;
            }
            let (a, b) = line
                .split_once(' ')
                .ok_or_else(|| anyhow!("Malformed merge rule: {}", line))?;
            let rank = merge_ranks.len();
            merge_ranks.insert((a.to_string(), b.to_string()), rank);
        }

        let start_id = *encoder
            .get(START_TOKEN)
            .ok_or_else(|| anyhow!("vocab.json lacks {}", START_TOKEN))?;
        let end_id = *encoder
            .get(END_TOKEN)
            .ok_or_else(|| anyhow!("vocab.json lacks {}", END_TOKEN))?;

        Ok(Self {
            encoder,
            merge_ranks,
            byte_encoder: bytes_to_unicode(),
            pattern: Regex::new(TOKEN_PATTERN)?,
            start_id,
            end_id,
        })
    }

    /// Token ids without the start/end markers. Unknown pieces are dropped.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let cleaned = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut ids = Vec::new();
        for m in self.pattern.find_iter(&cleaned) {
            let word: String = m
                .as_str()
                .bytes()
                .map(|b| self.byte_encoder[b as usize])
                .collect();
            for piece in self.bpe(&word) {
                if let Some(&id) = self.encoder.get(&piece) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Framed and zero-padded row of exactly [`CONTEXT_LENGTH`] ids.
    pub fn encode_padded(&self, text: &str) -> Vec<i64> {
        let mut input_ids = Vec::with_capacity(CONTEXT_LENGTH);
        input_ids.push(self.start_id);
        input_ids.extend(self.encode(text).into_iter().take(CONTEXT_LENGTH - 2));
        input_ids.push(self.end_id);
        input_ids.resize(CONTEXT_LENGTH, 0);
        input_ids
    }

    fn bpe(&self, word: &str) -> Vec<String> {
        let mut parts: Vec<String> = word.chars().map(|c| c.to_string()).collect();
        match parts.last_mut() {
            Some(last) => last.push_str(WORD_END),
            None => return parts,
        }

        while parts.len() > 1 {
            let best = parts
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.merge_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min();

            let Some((rank, _)) = best else { break };

            // Merge every occurrence of the winning pair, left to right.
            let mut merged = Vec::with_capacity(parts.len());
            let mut i = 0;
            while i < parts.len() {
                if i + 1 < parts.len()
                    && self.merge_ranks.get(&(parts[i].clone(), parts[i + 1].clone())) == Some(&rank)
                {
                    merged.push(format!("{}{}", parts[i], parts[i + 1]));
                    i += 2;
                } else {
                    merged.push(parts[i].clone());
                    i += 1;
                }
            }
            parts = merged;
        }

        parts
    }
}

/// GPT-2 style reversible byte to printable-char table.
fn bytes_to_unicode() -> [char; 256] {
    let printable = |b: u32| {
        (b'!' as u32..=b'~' as u32).contains(&b)
            || (0xA1..=0xAC).contains(&b)
            || (0xAE..=0xFF).contains(&b)
    };

    let mut table = ['\0'; 256];
    let mut extra = 0u32;
    for b in 0..256u32 {
        let code = if printable(b) {
            b
        } else {
            extra += 1;
            255 + extra
        };
        table[b as usize] = char::from_u32(code).unwrap_or('?');
    }
    table
}
