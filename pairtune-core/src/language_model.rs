use anyhow::{Result, anyhow};
use candle_core::{D, DType, Tensor};
use candle_nn::{Module, ops::log_softmax};

pub trait LanguageModel: Module {
    /// The longest context the model can look at.
    fn max_positions(&self) -> usize;
}

/// Cross entropy of predicting each token from the ones before it.
///
/// `logits` is `(batch, time, vocab)`, while `input_ids` and `attention_mask`
/// are `(batch, time)`. The labels are just the inputs shifted left by one,
/// and any position whose label is padding doesn't count toward the loss.
pub fn causal_lm_loss(logits: &Tensor, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch_size, time_steps, vocab_size) = logits.dims3()?;
    if time_steps < 2 {
        return Err(anyhow!(
            "need at least two tokens per sequence to compute a loss, got {time_steps}"
        ));
    }
    let targets = batch_size * (time_steps - 1);

    let flat_logits = logits
        .narrow(1, 0, time_steps - 1)?
        .contiguous()?
        .reshape((targets, vocab_size))?;
    let flat_labels = input_ids
        .narrow(1, 1, time_steps - 1)?
        .contiguous()?
        .reshape((targets, 1))?;
    let flat_mask = attention_mask
        .narrow(1, 1, time_steps - 1)?
        .contiguous()?
        .reshape(targets)?
        .to_dtype(DType::F32)?;

    let num_targets: f32 = flat_mask.sum_all()?.to_scalar()?;
    if num_targets == 0.0 {
        return Err(anyhow!("batch contains no tokens to predict"));
    }

    let log_probs = log_softmax(&flat_logits, D::Minus1)?;
    let nll = log_probs.gather(&flat_labels, 1)?.squeeze(1)?.neg()?;
    let loss = ((nll * flat_mask)?.sum_all()? / num_targets as f64)?;
    Ok(loss)
}
