use crate::utils::resolve_model_file;
use crate::{Result, VoiceTuneError};
use std::path::Path;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, warn};

/// Token ids and attention mask for one transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEncoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

/// Text processor wrapping a pretrained tokenizer.
/// Truncates every transcript to `max_length` tokens.
pub struct TextProcessor {
    tokenizer: Tokenizer,
    pad_token_id: u32,
}

impl TextProcessor {
    /// Wrap an already-loaded tokenizer.
    pub fn new(mut tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        if max_length == 0 {
            return Err(VoiceTuneError::ConfigError(
                "max_text_length must be positive".to_string(),
            ));
        }

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| {
                VoiceTuneError::InitializationError(format!("Failed to set truncation: {}", e))
            })?;

        let pad_token_id = match tokenizer.get_padding().map(|p| p.pad_id) {
            Some(id) => id,
            None => match tokenizer.token_to_id("<pad>") {
                Some(id) => id,
                None => {
                    warn!("Tokenizer defines no pad token, padding with id 0");
                    0
                }
            },
        };
        debug!(
            "Text processor ready: vocab={}, pad_id={}, max_length={}",
            tokenizer.get_vocab_size(true),
            pad_token_id,
            max_length
        );

        Ok(Self {
            tokenizer,
            pad_token_id,
        })
    }

    /// Load a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            VoiceTuneError::InitializationError(format!(
                "Failed to load tokenizer {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::new(tokenizer, max_length)
    }

    /// Load the tokenizer from a local file, a local model directory, or a
    /// Hugging Face Hub repo id.
    pub fn from_pretrained(source: &str, max_length: usize) -> Result<Self> {
        let path = resolve_model_file(source, "tokenizer.json")?;
        Self::from_file(path, max_length)
    }

    pub fn encode(&self, text: &str) -> Result<TextEncoding> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| VoiceTuneError::ProcessingError(format!("Tokenization failed: {}", e)))?;

        Ok(TextEncoding {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Write `tokenizer.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.tokenizer
            .save(dir.join("tokenizer.json"), false)
            .map_err(|e| VoiceTuneError::IoError(format!("Failed to save tokenizer: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn word_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "<pad>": 1, "hello": 2, "world": 3, "again": 4},
                "unk_token": "<unk>"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    #[test]
    fn test_pad_id_from_vocab() {
        let processor = TextProcessor::new(word_tokenizer(), 8).unwrap();
        assert_eq!(processor.pad_token_id(), 1);
        assert_eq!(processor.vocab_size(), 5);
    }

    #[test]
    fn test_encode_and_truncate() {
        let processor = TextProcessor::new(word_tokenizer(), 2).unwrap();
        let enc = processor.encode("hello world again").unwrap();
        assert_eq!(enc.input_ids, vec![2, 3]);
        assert_eq!(enc.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let processor = TextProcessor::new(word_tokenizer(), 8).unwrap();
        let enc = processor.encode("hello stranger").unwrap();
        assert_eq!(enc.input_ids, vec![2, 0]);
    }

    #[test]
    fn test_empty_text_has_no_tokens() {
        let processor = TextProcessor::new(word_tokenizer(), 8).unwrap();
        let enc = processor.encode("   ").unwrap();
        assert!(enc.input_ids.is_empty());
        assert!(enc.attention_mask.is_empty());
    }

    #[test]
    fn test_zero_max_length_rejected() {
        assert!(TextProcessor::new(word_tokenizer(), 0).is_err());
    }
}
