//! Tokenizer interface and a score-based piece tokenizer.

use crate::error::{GemmaError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Text <-> token id conversion consumed by the generation loop.
pub trait Tokenizer {
    /// Encode text, prepending BOS.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids back to text, skipping control tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn pad_id(&self) -> u32;

    fn eos_id(&self) -> u32;
}

/// Control token ids in the Gemma vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub eos: u32,
    pub bos: u32,
    pub unk: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        SpecialTokens {
            pad: 0,
            eos: 1,
            bos: 2,
            unk: 3,
        }
    }
}

/// Word-boundary marker used in piece vocabularies.
const SPACE_MARKER: char = '\u{2581}';

/// Tokenizer holding vocabulary pieces and merge scores.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    pub vocab: Vec<String>,
    pub scores: Vec<f32>,
    pub vocab_map: HashMap<String, u32>,
    pub special: SpecialTokens,
}

impl VocabTokenizer {
    pub fn new(vocab: Vec<String>, scores: Vec<f32>, special: SpecialTokens) -> Result<Self> {
        if vocab.len() != scores.len() {
            return Err(GemmaError::Tokenizer(format!(
                "{} pieces but {} scores",
                vocab.len(),
                scores.len()
            )));
        }
        let ids = [
            ("pad", special.pad),
            ("eos", special.eos),
            ("bos", special.bos),
            ("unk", special.unk),
        ];
        if let Some((name, id)) = ids.iter().find(|(_, id)| *id as usize >= vocab.len()) {
            return Err(GemmaError::Tokenizer(format!(
                "{name} id {id} outside vocabulary of {}",
                vocab.len()
            )));
        }
        let vocab_map = vocab
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i as u32))
            .collect();
        Ok(VocabTokenizer {
            vocab,
            scores,
            vocab_map,
            special,
        })
    }

    /// Load `vocab_size` (score, piece) records from a binary file.
    pub fn load<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        Self::read(&mut BufReader::new(file), vocab_size)
    }

    pub fn read<R: Read>(reader: &mut R, vocab_size: usize) -> Result<Self> {
        let _max_token_len = reader.read_u32::<LittleEndian>()?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            scores.push(reader.read_f32::<LittleEndian>()?);
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let mut buf = Vec::new();
            reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
            if buf.len() != len {
                return Err(GemmaError::Tokenizer(format!(
                    "piece truncated: {} of {len} bytes",
                    buf.len()
                )));
            }
            vocab.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Self::new(vocab, scores, SpecialTokens::default())
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn piece_id(&self, piece: &str) -> Option<u32> {
        self.vocab_map.get(piece).copied()
    }

    fn is_control(&self, id: u32) -> bool {
        let s = self.special;
        id == s.pad || id == s.eos || id == s.bos
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut tokens: Vec<u32> = Vec::with_capacity(text.len() + 1);
        let normalized: String = text
            .chars()
            .map(|c| if c == ' ' { SPACE_MARKER } else { c })
            .collect();

        // One token per character, byte fallback for unknown characters
        for c in normalized.chars() {
            let mut utf8 = [0u8; 4];
            if let Some(id) = self.piece_id(c.encode_utf8(&mut utf8)) {
                tokens.push(id);
                continue;
            }
            for b in c.encode_utf8(&mut utf8).bytes() {
                let id = self
                    .piece_id(&format!("<0x{b:02X}>"))
                    .unwrap_or(self.special.unk);
                tokens.push(id);
            }
        }

        // Iteratively merge the best-scoring adjacent pair
        loop {
            let mut best: Option<(f32, u32, usize)> = None;
            for i in 0..tokens.len().saturating_sub(1) {
                let merged = format!(
                    "{}{}",
                    self.vocab[tokens[i] as usize],
                    self.vocab[tokens[i + 1] as usize]
                );
                if let Some(id) = self.piece_id(&merged) {
                    let score = self.scores[id as usize];
                    if best.is_none_or(|(s, _, _)| score > s) {
                        best = Some((score, id, i));
                    }
                }
            }
            let Some((_, id, idx)) = best else { break };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        tokens.insert(0, self.special.bos);
        Ok(tokens)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if self.is_control(id) {
                continue;
            }
            let piece = self
                .vocab
                .get(id as usize)
                .ok_or_else(|| GemmaError::Tokenizer(format!("token id {id} out of range")))?;
            // Byte tokens are spelled <0xXX>
            if piece.len() == 6 && piece.starts_with("<0x") && piece.ends_with('>') {
                if let Ok(byte) = u8::from_str_radix(&piece[3..5], 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.extend(piece.replace(SPACE_MARKER, " ").into_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pad_id(&self) -> u32 {
        self.special.pad
    }

    fn eos_id(&self) -> u32 {
        self.special.eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> VocabTokenizer {
        let pieces = [
            "<pad>", "<eos>", "<bos>", "<unk>", "a", "b", "\u{2581}", "ab", "\u{2581}ab", "<0xC3>",
            "<0xA9>",
        ];
        let scores = vec![0.0, 0.0, 0.0, 0.0, -1.0, -1.0, -1.0, -0.5, -0.2, -5.0, -5.0];
        VocabTokenizer::new(
            pieces.iter().map(|s| s.to_string()).collect(),
            scores,
            SpecialTokens::default(),
        )
        .unwrap()
    }

    #[test]
    fn encode_merges_by_score_and_prepends_bos() {
        let tok = toy();
        assert_eq!(tok.encode("ab").unwrap(), vec![2, 7]);
        assert_eq!(tok.encode("ab ab").unwrap(), vec![2, 7, 8]);
    }

    #[test]
    fn unknown_characters_fall_back_to_bytes() {
        let tok = toy();
        // 'é' is C3 A9 in UTF-8; 'z' has no byte pieces in the toy vocabulary
        assert_eq!(tok.encode("é").unwrap(), vec![2, 9, 10]);
        assert_eq!(tok.encode("z").unwrap(), vec![2, 3]);
    }

    #[test]
    fn decode_restores_spaces_and_bytes() {
        let tok = toy();
        assert_eq!(tok.decode(&[2, 7, 8, 9, 10, 1]).unwrap(), "ab abé");
        assert!(tok.decode(&[42]).is_err());
    }

    #[test]
    fn read_parses_score_and_piece_records() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        for (score, piece) in [(0.0f32, "<pad>"), (0.0, "<eos>"), (0.0, "<bos>"), (-1.5, "hi")] {
            bytes.extend(score.to_le_bytes());
            bytes.extend((piece.len() as u32).to_le_bytes());
            bytes.extend(piece.as_bytes());
        }
        let tok = VocabTokenizer::read(&mut bytes.as_slice(), 4).unwrap();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.scores[3], -1.5);
        assert_eq!(tok.eos_id(), 1);
        assert_eq!(tok.encode("zz").unwrap(), vec![2, 3, 3]);
    }

    #[test]
    fn read_rejects_truncated_piece() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend(0.0f32.to_le_bytes());
        bytes.extend(u32::MAX.to_le_bytes());
        bytes.extend(b"abc");
        assert!(matches!(
            VocabTokenizer::read(&mut bytes.as_slice(), 1),
            Err(GemmaError::Tokenizer(_))
        ));
    }

    #[test]
    fn special_ids_must_fit_the_vocabulary() {
        let pieces: Vec<String> = ["<pad>", "<eos>", "<bos>"].iter().map(|s| s.to_string()).collect();
        let err = VocabTokenizer::new(pieces.clone(), vec![0.0; 3], SpecialTokens::default())
            .unwrap_err();
        assert!(matches!(err, GemmaError::Tokenizer(_)));
        assert!(err.to_string().contains("unk"));

        let special = SpecialTokens {
            unk: 0,
            ..SpecialTokens::default()
        };
        let tok = VocabTokenizer::new(pieces, vec![0.0; 3], special).unwrap();
        assert_eq!(tok.encode("z").unwrap(), vec![2, 0]);
    }
}
