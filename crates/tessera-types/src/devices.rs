//! Device and element types

use serde::{Deserialize, Serialize};

/// Device holding the Block Store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    CPU,
    /// NVIDIA CUDA device with device index
    CUDA(usize),
    /// AMD ROCm device with device index
    ROCm(usize),
}

impl Device {
    /// Check if device is GPU-based
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::CUDA(_) | Device::ROCm(_))
    }

    /// Get device index for GPU devices
    pub fn index(&self) -> Option<usize> {
        match self {
            Device::CUDA(idx) | Device::ROCm(idx) => Some(*idx),
            Device::CPU => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::CPU => write!(f, "cpu"),
            Device::CUDA(idx) => write!(f, "cuda:{}", idx),
            Device::ROCm(idx) => write!(f, "rocm:{}", idx),
        }
    }
}

/// Element type of the cached keys and values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit floating point
    FP32,
    /// 16-bit floating point (IEEE 754)
    FP16,
    /// 16-bit brain floating point
    BF16,
    /// 8-bit floating point (E5M2 or E4M3)
    FP8,
    /// 8-bit signed integer
    INT8,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::FP32 => 4,
            DataType::FP16 | DataType::BF16 => 2,
            DataType::FP8 | DataType::INT8 => 1,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        !matches!(self, DataType::INT8)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::FP32 => "fp32",
            DataType::FP16 => "fp16",
            DataType::BF16 => "bf16",
            DataType::FP8 => "fp8",
            DataType::INT8 => "int8",
        };
        write!(f, "{}", name)
    }
}
