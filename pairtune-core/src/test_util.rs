//! Tiny stand-ins for a real GPT-2 checkpoint, so tests can run on the CPU
//! in a blink.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde_json::json;

use crate::{
    gpt2::{Gpt2Config, Gpt2Model},
    pretrained::ModelFiles,
    tokenizer::{ENDOFTEXT, PretrainedTokenizer},
};

pub const TINY_VOCAB: &[&str] = &[
    ENDOFTEXT, "<unk>", "User", ":", "Assistant", "The", "user", "asked", "Here", "'", "s",
    "the", "response", "Question", "Answer", "hi", "hello", "how", "are", "you", "fine", "?",
    ".", "good", "bye", "thanks",
];

pub fn tiny_tokenizer_json() -> String {
    let vocab: serde_json::Map<String, serde_json::Value> = TINY_VOCAB
        .iter()
        .enumerate()
        .map(|(i, word)| (word.to_string(), json!(i)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 0,
            "content": ENDOFTEXT,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    })
    .to_string()
}

pub fn tiny_tokenizer() -> PretrainedTokenizer {
    PretrainedTokenizer::from_bytes(tiny_tokenizer_json().as_bytes(), None).unwrap()
}

pub fn tiny_config(vocab_size: usize) -> Gpt2Config {
    Gpt2Config {
        vocab_size,
        n_positions: 32,
        n_embd: 16,
        n_layer: 2,
        n_head: 2,
        n_inner: None,
        layer_norm_epsilon: 1e-5,
        embd_pdrop: 0.0,
        attn_pdrop: 0.0,
        resid_pdrop: 0.0,
        bos_token_id: Some(0),
        eos_token_id: Some(0),
        extra: serde_json::Map::new(),
    }
}

/// Writes a randomly initialized checkpoint into `dir`.
pub fn write_tiny_model_dir(dir: &Path) {
    let config = tiny_config(TINY_VOCAB.len());
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    Gpt2Model::new(&config, vb).unwrap();

    let files = ModelFiles::in_dir(dir);
    std::fs::create_dir_all(dir).unwrap();
    varmap.save(&files.weights).unwrap();
    std::fs::write(&files.config, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    std::fs::write(&files.tokenizer, tiny_tokenizer_json()).unwrap();
}
