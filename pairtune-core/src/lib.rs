pub mod dataset;
pub mod encoding;
pub mod generation;
pub mod gpt2;
pub mod language_model;
pub mod pipeline;
pub mod pretrained;
pub mod safetensors_loader;
pub mod staging;
pub mod templates;
pub mod tokenizer;
pub mod training;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;
