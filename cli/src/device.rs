use anyhow::{Result, bail};
use std::fmt::Display;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Device {
    /// Use the best accelerator this build supports, falling back to the CPU.
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Auto => write!(f, "the best available device"),
            Device::Cpu => write!(f, "CPU"),
            Device::Cuda => write!(f, "CUDA"),
            Device::Metal => write!(f, "Metal"),
        }
    }
}

impl Device {
    pub fn to_candle_device(&self) -> Result<candle_core::Device> {
        match self {
            Device::Auto => {
                if cfg!(feature = "cuda") && candle_core::utils::cuda_is_available() {
                    Device::Cuda.to_candle_device()
                } else if cfg!(feature = "metal") && candle_core::utils::metal_is_available() {
                    Device::Metal.to_candle_device()
                } else {
                    Ok(candle_core::Device::Cpu)
                }
            }
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda => {
                if !cfg!(feature = "cuda") {
                    bail!(
                        "CUDA is not supported in this build, you need to compile with the 'cuda' feature!"
                    );
                }
                Ok(candle_core::Device::new_cuda(0)?)
            }
            Device::Metal => {
                if !cfg!(feature = "metal") {
                    bail!(
                        "Metal is not supported in this build, you need to compile with the 'metal' feature!"
                    );
                }
                Ok(candle_core::Device::new_metal(0)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_always_available() {
        assert!(Device::Cpu.to_candle_device().unwrap().is_cpu());
    }

    #[test]
    fn test_auto_without_accelerator_features_is_cpu() {
        if !cfg!(feature = "cuda") && !cfg!(feature = "metal") {
            assert!(Device::Auto.to_candle_device().unwrap().is_cpu());
        }
    }

    #[test]
    fn test_unsupported_accelerator_is_an_error() {
        if !cfg!(feature = "cuda") {
            assert!(Device::Cuda.to_candle_device().is_err());
        }
    }
}
