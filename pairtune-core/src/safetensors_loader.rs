use anyhow::{Result, anyhow};
use candle_core::{
    DType, Device, Tensor,
    safetensors::{BufferedSafetensors, MmapedSafetensors},
};
use candle_nn::VarMap;

/// Some GPT-2 checkpoints nest everything except the head under this.
const TRANSFORMER_PREFIX: &str = "transformer.";

/// Ideally this would be a trait supported by all the
/// safetensors structs in candle.
pub trait SafetensorsLoader {
    fn load_tensor(&self, name: &str, dev: &Device) -> candle_core::Result<Tensor>;
}

impl SafetensorsLoader for MmapedSafetensors {
    fn load_tensor(&self, name: &str, dev: &Device) -> candle_core::Result<Tensor> {
        self.load(name, dev)
    }
}

impl SafetensorsLoader for BufferedSafetensors {
    fn load_tensor(&self, name: &str, dev: &Device) -> candle_core::Result<Tensor> {
        self.load(name, dev)
    }
}

/// Populates every variable in `varmap` from the safetensors data, looking
/// each one up both as-is and under the `transformer.` prefix. Tensors in the
/// file that the varmap doesn't know about (like GPT-2's cached attention
/// masks) are ignored.
pub fn load_data_from_safetensors<T: SafetensorsLoader>(
    varmap: &mut VarMap,
    safetensors: &T,
) -> Result<()> {
    // This is mostly what VarMap::load() does, but that method is specific to
    // loading data from a file, while this isn't.
    let mut tensor_data = varmap.data().lock().unwrap();
    for (name, var) in tensor_data.iter_mut() {
        let data = match safetensors.load_tensor(name, var.device()) {
            Ok(data) => data,
            Err(_) => safetensors
                .load_tensor(&format!("{TRANSFORMER_PREFIX}{name}"), var.device())
                .map_err(|err| anyhow!("checkpoint is missing {name}: {err}"))?,
        };
        // Half-precision checkpoints are a thing, but we train in f32.
        let data = if data.dtype() == var.dtype() {
            data
        } else {
            data.to_dtype(DType::F32)?.to_dtype(var.dtype())?
        };
        if let Err(err) = var.set(&data) {
            return Err(anyhow!("error setting {name} using safetensor data: {err}",));
        }
    }
    Ok(())
}
