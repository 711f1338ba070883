use core::f32;

use anyhow::{Result, anyhow};
use candle_core::{D, DType, IndexOp, Tensor};
use candle_nn::{
    Embedding, Init, Module, Sequential, VarBuilder,
    ops::{dropout, softmax},
};
use serde::{Deserialize, Serialize};

use crate::language_model::LanguageModel;

/// Standard deviation GPT-2 uses to initialize its weights.
const INITIALIZER_RANGE: f64 = 0.02;

const NORMAL_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: INITIALIZER_RANGE,
};

/// Multiplier for the MLP's hidden layer when `n_inner` isn't given.
const FEED_FORWARD_OUTPUT_DIMS: usize = 4;

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_pdrop() -> f32 {
    0.1
}

/// The subset of a Hugging Face GPT-2 `config.json` that we actually use.
/// Anything else in the file is carried along in `extra` so that saving a
/// fine-tuned model doesn't lose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_pdrop")]
    pub embd_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub attn_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub resid_pdrop: f32,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Gpt2Config {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn inner_dims(&self) -> usize {
        self.n_inner.unwrap_or(FEED_FORWARD_OUTPUT_DIMS * self.n_embd)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 {
            return Err(anyhow!("must have a positive number of attention heads!"));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(anyhow!(
                "embedding dimensions ({}) must be divisible by attention heads ({})!",
                self.n_embd,
                self.n_head
            ));
        }
        Ok(())
    }
}

/// This is similar to candle_nn::Dropout with a few salient differences:
///
///   * Instead of implementing `ModuleT`, it detects whether
///     we're training by checking whether the input tensor is part of a
///     computation graph.
///
///   * If `drop_p` is zero, we disable dropout completely, which means
///     there's no efficiency penalty.
struct Dropout {
    drop_p: f32,
}

impl Dropout {
    pub fn new(drop_p: f32) -> Dropout {
        Self { drop_p }
    }
}

impl Module for Dropout {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let is_training = xs.track_op();

        if self.drop_p > 0.0 && is_training {
            dropout(xs, self.drop_p)
        } else {
            Ok(xs.clone())
        }
    }
}

/// We're implementing our own layer norm because Candle's built-in one doesn't
/// seem to support backprop: https://github.com/huggingface/candle/issues/2977
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(n_embd: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(n_embd, "weight", candle_nn::init::ONE)?;
        let bias = vb.get_with_hints(n_embd, "bias", candle_nn::init::ZERO)?;
        Ok(LayerNorm { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xmean = xs.mean_keepdim(D::Minus1)?;
        // Pytorch normalizes with the biased variance, while `var_keepdim`
        // is unbiased, so we compute it by hand.
        let xcentered = xs.broadcast_sub(&xmean)?;
        let xvar = xcentered.sqr()?.mean_keepdim(D::Minus1)?;
        let xhat = xcentered.broadcast_div(&(xvar + self.eps)?.sqrt()?)?;
        self.weight
            .broadcast_mul(&xhat)?
            .broadcast_add(&self.bias)
    }
}

/// GPT-2 calls its linear layers "Conv1D", and stores their weights
/// transposed relative to `candle_nn::Linear`, i.e. as `(in, out)`.
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn new(in_dims: usize, out_dims: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((in_dims, out_dims), "weight", NORMAL_INIT)?;
        let bias = vb.get_with_hints(out_dims, "bias", candle_nn::init::ZERO)?;
        Ok(Self { weight, bias })
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

struct CausalSelfAttention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    tril: Tensor,
    neg_infinity: Tensor,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
}

impl CausalSelfAttention {
    fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        // All three of key, query and value live in one fused projection.
        let c_attn = Conv1D::new(n_embd, 3 * n_embd, vb.pp("c_attn"))?;
        let c_proj = Conv1D::new(n_embd, n_embd, vb.pp("c_proj"))?;
        let tril = Tensor::tril2(config.n_positions, DType::U8, vb.device())?;
        let neg_infinity = Tensor::full(f32::NEG_INFINITY, (1,), vb.device())?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            tril,
            neg_infinity,
            attn_dropout: Dropout::new(config.attn_pdrop),
            resid_dropout: Dropout::new(config.resid_pdrop),
        })
    }
}

impl Module for CausalSelfAttention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batches, time_steps, n_embd) = xs.dims3()?;
        let head_size = n_embd / self.n_head;

        let qkv = self.c_attn.forward(xs)?;
        let split_heads = |i: usize| -> candle_core::Result<Tensor> {
            qkv.narrow(2, i * n_embd, n_embd)?
                .reshape((batches, time_steps, self.n_head, head_size))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(0)?;
        let k = split_heads(1)?;
        let v = split_heads(2)?;

        let shape = (batches, self.n_head, time_steps, time_steps);
        let wei = (q.matmul(&k.t()?.contiguous()?)? / (head_size as f64).sqrt())?;
        let tril_mask = self
            .tril
            .i((0..time_steps, 0..time_steps))?
            .broadcast_as(shape)?;
        let wei = tril_mask.where_cond(&wei, &self.neg_infinity.broadcast_as(shape)?)?;
        let wei = softmax(&wei, D::Minus1)?;
        let wei = self.attn_dropout.forward(&wei)?;

        let out = wei
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batches, time_steps, n_embd))?;
        let out = self.c_proj.forward(&out)?;
        self.resid_dropout.forward(&out)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
    dropout: Dropout,
}

impl Mlp {
    fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let inner = config.inner_dims();
        let c_fc = Conv1D::new(config.n_embd, inner, vb.pp("c_fc"))?;
        let c_proj = Conv1D::new(inner, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            dropout: Dropout::new(config.resid_pdrop),
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // Candle's `gelu` is the tanh approximation, which is what GPT-2 uses.
        let out = self.c_fc.forward(xs)?.gelu()?;
        let out = self.c_proj.forward(&out)?;
        self.dropout.forward(&out)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: LayerNorm::new(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: LayerNorm::new(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?)?)?;
        let xs = (&xs + self.mlp.forward(&self.ln_2.forward(&xs)?)?)?;
        Ok(xs)
    }
}

/// A GPT-2 style causal language model whose variables are named the same
/// way as Hugging Face's checkpoints (`wte`, `h.0.attn.c_attn`, etc.).
pub struct Gpt2Model {
    n_positions: usize,
    wte: Embedding,
    wpe: Embedding,
    positions: Tensor,
    dropout: Dropout,
    blocks: Sequential,
    ln_f: LayerNorm,
}

impl Gpt2Model {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vb.device();
        let wte = Embedding::new(
            vb.pp("wte")
                .get_with_hints((config.vocab_size, config.n_embd), "weight", NORMAL_INIT)?,
            config.n_embd,
        );
        let wpe = Embedding::new(
            vb.pp("wpe")
                .get_with_hints((config.n_positions, config.n_embd), "weight", NORMAL_INIT)?,
            config.n_embd,
        );
        let positions = Tensor::arange(0 as u32, config.n_positions as u32, device)?;
        let mut blocks = candle_nn::seq();
        for i in 0..config.n_layer {
            blocks = blocks.add(Block::new(config, vb.pp(format!("h.{i}")))?);
        }
        let ln_f = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        Ok(Self {
            n_positions: config.n_positions,
            wte,
            wpe,
            positions,
            dropout: Dropout::new(config.embd_pdrop),
            blocks,
            ln_f,
        })
    }
}

impl Module for Gpt2Model {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let time_steps = xs.dims2()?.1;
        if time_steps > self.n_positions {
            candle_core::bail!(
                "sequence of {time_steps} tokens is longer than the model's {} positions",
                self.n_positions
            );
        }
        let tok_emb = self.wte.forward(xs)?;
        let pos_emb = self.wpe.forward(&self.positions.i(0..time_steps)?)?;
        let x = self.dropout.forward(&tok_emb.broadcast_add(&pos_emb)?)?;
        let out = self.blocks.forward(&x)?;
        let out = self.ln_f.forward(&out)?;
        // The language model head shares its weights with the token embedding.
        out.broadcast_matmul(&self.wte.embeddings().t()?)
    }
}

impl LanguageModel for Gpt2Model {
    fn max_positions(&self) -> usize {
        self.n_positions
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;
    use crate::test_util::tiny_config;
    use crate::util::{assert_equal_tensors, count_params};

    #[test]
    fn test_config_parses_hugging_face_json() {
        let json = r#"{
            "activation_function": "gelu_new",
            "architectures": ["GPT2LMHeadModel"],
            "bos_token_id": 50256,
            "eos_token_id": 50256,
            "layer_norm_epsilon": 1e-05,
            "model_type": "gpt2",
            "n_ctx": 1024,
            "n_embd": 768,
            "n_head": 12,
            "n_inner": null,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        }"#;
        let config = Gpt2Config::from_json(json).unwrap();
        assert_eq!(config.n_positions, 1024);
        assert_eq!(config.inner_dims(), 3072);
        assert_eq!(config.eos_token_id, Some(50256));
        assert_eq!(config.resid_pdrop, 0.1);
        assert_eq!(config.extra["model_type"], "gpt2");

        let saved = serde_json::to_string(&config).unwrap();
        assert_eq!(Gpt2Config::from_json(&saved).unwrap(), config);
    }

    #[test]
    fn test_heads_must_divide_embedding() {
        let mut config = tiny_config(10);
        config.n_head = 3;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Gpt2Model::new(&config, vb).is_err());
    }

    #[test]
    fn test_forward_shape_and_param_names() {
        let config = tiny_config(10);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();

        let xs = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let logits = model.forward(&xs).unwrap();
        assert_eq!(logits.dims3().unwrap(), (2, 3, 10));

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("wte.weight"));
        assert!(data.contains_key("h.1.attn.c_attn.weight"));
        assert!(data.contains_key("h.0.mlp.c_proj.bias"));
        assert!(data.contains_key("ln_f.weight"));
        assert!(!data.contains_key("lm_head.weight"));
        assert_eq!(data["h.0.attn.c_attn.weight"].dims(), &[16, 48]);
        drop(data);

        let n = config.n_embd;
        let per_block = 2 * 2 * n + (n * 3 * n + 3 * n) + (n * n + n) + (n * 4 * n + 4 * n) + (4 * n * n + n);
        let expected = 10 * n + config.n_positions * n + config.n_layer * per_block + 2 * n;
        assert_eq!(count_params(&varmap), expected);
    }

    #[test]
    fn test_attention_is_causal() {
        let config = tiny_config(10);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();

        // Changing a later token must not affect the logits of earlier ones.
        let a = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 2, 3, 9]], &Device::Cpu).unwrap();
        let logits_a = model.forward(&a).unwrap().i((0, 0..3)).unwrap();
        let logits_b = model.forward(&b).unwrap().i((0, 0..3)).unwrap();
        let diff: f32 = (logits_a - logits_b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_too_long_sequence_is_an_error() {
        let config = tiny_config(10);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();
        let xs = Tensor::zeros((1, config.n_positions + 1), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&xs).is_err());
    }

    #[test]
    fn test_layer_norm_normalizes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = LayerNorm::new(4, 1e-5, vb).unwrap();
        let xs = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();
        let out: Vec<f32> = ln.forward(&xs).unwrap().get(0).unwrap().to_vec1().unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 4.0;
        approx::assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
        approx::assert_relative_eq!(var, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_detached_vars_give_same_logits() {
        let config = tiny_config(10);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();

        let detached: std::collections::HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_detached_tensor()))
            .collect();
        let vb = VarBuilder::from_tensors(detached, DType::F32, &Device::Cpu);
        let model_no_grad = Gpt2Model::new(&config, vb).unwrap();

        let xs = Tensor::new(&[[3u32, 1, 4, 1, 5]], &Device::Cpu).unwrap();
        assert_equal_tensors(
            model.forward(&xs).unwrap(),
            model_no_grad.forward(&xs).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_dropout_only_applies_while_tracking_gradients() {
        let config = Gpt2Config {
            embd_pdrop: 0.5,
            attn_pdrop: 0.5,
            resid_pdrop: 0.5,
            ..tiny_config(10)
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();
        let detached: std::collections::HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_detached_tensor()))
            .collect();
        let vb = VarBuilder::from_tensors(detached, DType::F32, &Device::Cpu);
        let model_no_grad = Gpt2Model::new(&config, vb).unwrap();

        let xs = Tensor::new(&[[3u32, 1, 4, 1, 5, 9, 2, 6]], &Device::Cpu).unwrap();
        let a = model.forward(&xs).unwrap();
        let b = model.forward(&xs).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.0, "dropout should make training passes differ");

        assert_equal_tensors(
            model_no_grad.forward(&xs).unwrap(),
            model_no_grad.forward(&xs).unwrap(),
        )
        .unwrap();
    }
}
