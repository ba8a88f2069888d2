//! Host memory backend for the Block Store

use tessera_interfaces::{DeviceAllocator, DeviceBuffer};
use tessera_types::{DataType, Device, Result, TesseraError};
use tracing::trace;

/// Zero-initialised host memory region
#[derive(Debug)]
pub struct HostBuffer {
    data: Vec<u8>,
    dtype: DataType,
    device: Device,
}

impl HostBuffer {
    /// Infallible constructor for small scratch tensors
    pub fn zeroed(bytes: usize, dtype: DataType) -> Self {
        Self {
            data: vec![0u8; bytes],
            dtype,
            device: Device::CPU,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl DeviceBuffer for HostBuffer {
    fn len_bytes(&self) -> usize {
        self.data.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn device_ptr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Allocates Block Stores in host memory.
///
/// An optional byte limit models a device with bounded memory.
#[derive(Debug, Clone, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self { limit: None }
    }

    /// Refuse any single allocation larger than `bytes`
    pub fn with_limit(bytes: usize) -> Self {
        Self { limit: Some(bytes) }
    }
}

impl DeviceAllocator for HostAllocator {
    fn allocate(
        &self,
        bytes: usize,
        dtype: DataType,
        device: &Device,
    ) -> Result<Box<dyn DeviceBuffer>> {
        if *device != Device::CPU {
            return Err(TesseraError::device(format!(
                "host allocator cannot place memory on {device}"
            )));
        }
        if let Some(limit) = self.limit {
            if bytes > limit {
                return Err(TesseraError::allocation(format!(
                    "requested {bytes} bytes, host limit is {limit}"
                )));
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|e| {
            TesseraError::allocation(format!("failed to reserve {bytes} host bytes: {e}"))
        })?;
        data.resize(bytes, 0);
        trace!("Allocated {} host bytes for {}", bytes, dtype);

        Ok(Box::new(HostBuffer {
            data,
            dtype,
            device: Device::CPU,
        }))
    }

    fn name(&self) -> &str {
        "host"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zeroed() {
        let buf = HostAllocator::new()
            .allocate(64, DataType::FP16, &Device::CPU)
            .unwrap();
        assert_eq!(buf.len_bytes(), 64);
        assert_eq!(buf.len_elements(), 32);
        let host = buf.as_any().downcast_ref::<HostBuffer>().unwrap();
        assert!(host.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_limit() {
        let alloc = HostAllocator::with_limit(100);
        assert!(alloc.allocate(100, DataType::FP32, &Device::CPU).is_ok());
        let err = alloc
            .allocate(101, DataType::FP32, &Device::CPU)
            .unwrap_err();
        assert!(matches!(err, TesseraError::Allocation { .. }));
    }

    #[test]
    fn test_rejects_gpu_device() {
        let err = HostAllocator::new()
            .allocate(16, DataType::FP16, &Device::CUDA(0))
            .unwrap_err();
        assert!(matches!(err, TesseraError::Device { .. }));
    }
}
