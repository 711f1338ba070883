use std::path::Path;

use anyhow::{Result, anyhow};

/// GPT-2's one and only special token, which doubles as the padding token.
pub const ENDOFTEXT: &str = "<|endoftext|>";

pub trait Tokenizer {
    fn len(&self) -> usize;

    fn encode(&self, content: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn eos_token_id(&self) -> u32;

    /// We don't have a separate padding token, so we just pad with EOS.
    fn pad_token_id(&self) -> u32 {
        self.eos_token_id()
    }

    fn encode_truncated(&self, content: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut tokens = self.encode(content)?;
        tokens.truncate(max_length);
        Ok(tokens)
    }
}

/// A tokenizer loaded from a Hugging Face `tokenizer.json`.
#[derive(Clone)]
pub struct PretrainedTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: u32,
}

impl PretrainedTokenizer {
    pub fn new(inner: tokenizers::Tokenizer, eos_token_id: Option<u32>) -> Result<Self> {
        let eos_token_id = match eos_token_id {
            Some(id) => id,
            None => inner
                .token_to_id(ENDOFTEXT)
                .ok_or_else(|| anyhow!("tokenizer has no '{ENDOFTEXT}' token"))?,
        };
        Ok(Self {
            inner,
            eos_token_id,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, eos_token_id: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|err| anyhow!("unable to load tokenizer from {}: {err}", path.display()))?;
        Self::new(inner, eos_token_id)
    }

    pub fn from_bytes(bytes: &[u8], eos_token_id: Option<u32>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes).map_err(anyhow::Error::msg)?;
        Self::new(inner, eos_token_id)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.inner
            .save(path, true)
            .map_err(|err| anyhow!("unable to save tokenizer to {}: {err}", path.display()))
    }
}

impl Tokenizer for PretrainedTokenizer {
    fn len(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, content: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(content, false).map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special_tokens)
            .map_err(anyhow::Error::msg)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// A right-padded batch of token sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub input_ids: Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<Vec<u32>>,
}

impl PaddedBatch {
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, |ids| ids.len())
    }
}

/// Pads every sequence on the right to the length of the longest one.
pub fn pad_batch(sequences: &[&[u32]], pad_id: u32) -> PaddedBatch {
    let max_len = sequences.iter().map(|seq| seq.len()).max().unwrap_or(0);
    let mut input_ids = Vec::with_capacity(sequences.len());
    let mut attention_mask = Vec::with_capacity(sequences.len());
    for seq in sequences {
        let padding = max_len - seq.len();
        let mut ids = seq.to_vec();
        ids.extend(std::iter::repeat_n(pad_id, padding));
        let mut mask = vec![1; seq.len()];
        mask.extend(std::iter::repeat_n(0, padding));
        input_ids.push(ids);
        attention_mask.push(mask);
    }
    PaddedBatch {
        input_ids,
        attention_mask,
    }
}
