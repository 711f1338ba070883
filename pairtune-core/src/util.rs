use std::ops::Deref;

use anyhow::Result;
use candle_core::{Tensor, backprop::GradStore};
use candle_nn::VarMap;
use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
};
use tracing::{info, warn};

/// Picks one of `choices`, weighted by `weights`. Candle doesn't seem to have
/// multinomial sampling built-in, so the rand crate does the heavy lifting.
pub fn multinomial<R: Rng>(choices: &[u32], weights: &[f32], rng: &mut R) -> Result<u32> {
    let dist = WeightedIndex::new(weights)?;
    Ok(choices[dist.sample(rng)])
}

/// Uh, candle doesn't have an easy way of comparing tensors for
/// equality so we'll do this.
pub fn assert_equal_tensors(a: Tensor, b: Tensor) -> Result<()> {
    let eq = a.eq(&b)?.flatten_all()?.to_vec1::<u8>()?;
    for item in eq {
        assert_eq!(item, 1);
    }
    Ok(())
}

pub fn count_params(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}

pub fn log_gradient_info(varmap: &VarMap, gradients: &GradStore) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let tensor = data[name].deref();
        if let Some(grad) = gradients.get(tensor) {
            let grad_norm: f32 = grad.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
            info!("gradient norm for {name}: {:.4}", grad_norm);
            if grad_norm > 10.0 {
                warn!("Large gradient for {name}!");
            } else if grad_norm < 1e-6 {
                warn!("Vanishing gradient for {name}!");
            }
        } else {
            warn!("No gradient for {name}!");
        }
    }
    Ok(())
}
