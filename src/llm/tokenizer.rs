use std::path::Path;

use tokenizers::Tokenizer;

use super::RuntimeError;
use super::types::RuntimeKind;

const STOP_TOKENS: [&str; 4] = ["<eos>", "<end_of_turn>", "</s>", "<|endoftext|>"];

pub fn load_tokenizer(model_dir: &Path, backend: RuntimeKind) -> Result<Tokenizer, RuntimeError> {
    let path = model_dir.join("tokenizer.json");
    Tokenizer::from_file(&path).map_err(|e| RuntimeError::BackendLoad {
        backend,
        detail: format!("failed to load {}: {}", path.display(), e),
    })
}

pub fn stop_token_ids(tokenizer: &Tokenizer) -> Vec<u32> {
    STOP_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect()
}

pub fn encode_prompt(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>, RuntimeError> {
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| RuntimeError::Generation(format!("tokenization failed: {}", e)))?;
    Ok(encoding.get_ids().to_vec())
}

/// Turns a growing token list into text deltas. Decoding the whole sequence
/// each step keeps multi-token characters intact.
pub struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    emitted: String,
}

impl<'a> IncrementalDecoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            emitted: String::new(),
        }
    }

    pub fn step(&mut self, generated: &[u32]) -> Result<Option<String>, RuntimeError> {
        let text = decode(self.tokenizer, generated)?;
        if text.ends_with('\u{FFFD}') {
            // incomplete UTF-8 sequence; wait for the next token
            return Ok(None);
        }
        let delta = match text.strip_prefix(self.emitted.as_str()) {
            Some(rest) => rest.to_string(),
            None => return Ok(None),
        };
        if delta.is_empty() {
            return Ok(None);
        }
        self.emitted = text;
        Ok(Some(delta))
    }
}

pub fn decode(tokenizer: &Tokenizer, tokens: &[u32]) -> Result<String, RuntimeError> {
    tokenizer
        .decode(tokens, true)
        .map_err(|e| RuntimeError::Generation(format!("detokenization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokenizers::models::wordlevel::WordLevel;

    use super::*;

    fn word_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = [("<unk>", 0), ("<eos>", 1), ("hola", 2), ("mundo", 3)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn finds_known_stop_tokens() {
        let tokenizer = word_tokenizer();
        assert_eq!(stop_token_ids(&tokenizer), vec![1]);
    }

    #[test]
    fn incremental_decoder_emits_only_new_text() {
        let tokenizer = word_tokenizer();
        let mut decoder = IncrementalDecoder::new(&tokenizer);
        let first = decoder.step(&[2]).unwrap().unwrap();
        let second = decoder.step(&[2, 3]).unwrap().unwrap();
        assert_eq!(format!("{}{}", first, second), decode(&tokenizer, &[2, 3]).unwrap());
    }
}
