use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::{
    gpt2::{Gpt2Config, Gpt2Model},
    safetensors_loader::load_data_from_safetensors,
    tokenizer::PretrainedTokenizer,
    util::count_params,
};

pub const CONFIG_FILENAME: &str = "config.json";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const WEIGHTS_FILENAME: &str = "model.safetensors";

/// The three files that make up a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            config: dir.join(CONFIG_FILENAME),
            tokenizer: dir.join(TOKENIZER_FILENAME),
            weights: dir.join(WEIGHTS_FILENAME),
        }
    }

    /// Treats `source` as a local directory if one exists there, and as a
    /// Hugging Face hub model id (like `gpt2`) otherwise.
    pub fn resolve(source: &str) -> Result<Self> {
        let path = Path::new(source);
        if path.is_dir() {
            let files = Self::in_dir(path);
            for file in [&files.config, &files.tokenizer, &files.weights] {
                if !file.is_file() {
                    return Err(anyhow!("model directory is missing {}", file.display()));
                }
            }
            return Ok(files);
        }
        if path.exists() || source.starts_with('.') || source.starts_with('/') {
            return Err(anyhow!("{source} is not a model directory"));
        }

        info!("Fetching {source} from the Hugging Face hub.");
        let api = hf_hub::api::sync::Api::new().context("hf-hub API")?;
        let repo = api.model(source.to_owned());
        let get = |filename: &str| {
            repo.get(filename)
                .map_err(|err| anyhow!("unable to fetch {filename} for {source}: {err}"))
        };
        Ok(Self {
            config: get(CONFIG_FILENAME)?,
            tokenizer: get(TOKENIZER_FILENAME)?,
            weights: get(WEIGHTS_FILENAME)?,
        })
    }
}

/// A causal language model together with its tokenizer, with every
/// parameter living in a `VarMap` so that it can be trained.
pub struct Pretrained {
    pub config: Gpt2Config,
    pub tokenizer: PretrainedTokenizer,
    pub varmap: VarMap,
    pub model: Gpt2Model,
    device: Device,
}

impl Pretrained {
    pub fn load(source: &str, device: &Device) -> Result<Self> {
        let files = ModelFiles::resolve(source)?;
        info!("Loading model from {}.", files.weights.display());

        let config_json = std::fs::read_to_string(&files.config)
            .with_context(|| format!("unable to read {}", files.config.display()))?;
        let config = Gpt2Config::from_json(&config_json)?;
        let tokenizer = PretrainedTokenizer::from_file(&files.tokenizer, config.eos_token_id)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Gpt2Model::new(&config, vb)?;

        // This is taken from VarMap::load(), it's too bad it's unsafe.
        // Actually it is kind of funny that we're loading SAFE tensors in
        // an UNSAFE block...
        let data = unsafe { candle_core::safetensors::MmapedSafetensors::new(&files.weights)? };
        load_data_from_safetensors(&mut varmap, &data)?;
        info!("Parameters in model: {}", count_params(&varmap));

        Ok(Self {
            config,
            tokenizer,
            varmap,
            model,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Writes the weights, config and tokenizer into `dir` so that `load`
    /// (or anything else that reads Hugging Face checkpoints) can pick them
    /// back up.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("unable to create {}", dir.display()))?;
        let files = ModelFiles::in_dir(dir);
        self.varmap.save(&files.weights)?;
        std::fs::write(&files.config, serde_json::to_string_pretty(&self.config)?)?;
        self.tokenizer.save(&files.tokenizer)?;
        Ok(())
    }

    /// Builds a copy of the model over detached tensors.
    pub fn model_no_grad(&self) -> Result<Gpt2Model> {
        // "Freeze" the varmap as detached tensors to ensure that gradients aren't
        // calculated for our parameters, and that dropout is off.
        let varmap_data = self.varmap.data().lock().unwrap();
        let mut detached_vars: HashMap<String, Tensor> = HashMap::with_capacity(varmap_data.len());
        for (path, var) in varmap_data.iter() {
            detached_vars.insert(path.clone(), var.as_detached_tensor());
        }
        Gpt2Model::new(
            &self.config,
            VarBuilder::from_tensors(detached_vars, DType::F32, &self.device),
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{IndexOp, Module};

    use super::*;
    use crate::test_util::write_tiny_model_dir;
    use crate::tokenizer::Tokenizer;
    use crate::util::assert_equal_tensors;

    #[test]
    fn test_resolve_local_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_model_dir(dir.path());
        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files, ModelFiles::in_dir(dir.path()));
    }

    #[test]
    fn test_resolve_incomplete_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "{}").unwrap();
        assert!(ModelFiles::resolve(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_resolve_missing_path_is_an_error() {
        assert!(ModelFiles::resolve("./no/such/model").is_err());
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_model_dir(dir.path());
        let pretrained = Pretrained::load(dir.path().to_str().unwrap(), &Device::Cpu).unwrap();
        assert_eq!(pretrained.tokenizer.eos_token_id(), 0);

        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("trained");
        pretrained.save(&out_dir).unwrap();
        let reloaded = Pretrained::load(out_dir.to_str().unwrap(), &Device::Cpu).unwrap();
        assert_eq!(reloaded.config, pretrained.config);

        let xs = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        assert_equal_tensors(
            pretrained.model_no_grad().unwrap().forward(&xs).unwrap(),
            reloaded.model_no_grad().unwrap().forward(&xs).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_model_no_grad_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_model_dir(dir.path());
        let pretrained = Pretrained::load(dir.path().to_str().unwrap(), &Device::Cpu).unwrap();
        let xs = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let logits = pretrained.model_no_grad().unwrap().forward(&xs).unwrap();
        assert!(!logits.track_op());
        assert!(pretrained.model.forward(&xs).unwrap().i(0).unwrap().track_op());
    }
}
