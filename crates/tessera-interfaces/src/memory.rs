//! Device memory interfaces
//!
//! The KV core never allocates device memory itself. It asks a
//! [`DeviceAllocator`] for one contiguous region when a pool is created and
//! addresses it by block index from then on.

use std::fmt::Debug;
use tessera_types::{DataType, Device, Result};

/// A contiguous region of device memory
pub trait DeviceBuffer: Send + Sync + Debug {
    /// Size of the region in bytes
    fn len_bytes(&self) -> usize;

    /// Device where the region lives
    fn device(&self) -> &Device;

    /// Element type the region was allocated for
    fn dtype(&self) -> DataType;

    /// Base address handed to kernels
    fn device_ptr(&self) -> u64;

    /// Downcast support for backend-specific buffers
    fn as_any(&self) -> &dyn std::any::Any;

    /// Number of elements of `dtype()` that fit in the region
    fn len_elements(&self) -> usize {
        self.len_bytes() / self.dtype().size_bytes()
    }
}

/// Device memory allocation primitive
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `bytes` of contiguous memory on `device`.
    ///
    /// Fails with `TesseraError::Allocation` when the device cannot provide
    /// the region. Implementations must not retry with a smaller size.
    fn allocate(&self, bytes: usize, dtype: DataType, device: &Device)
        -> Result<Box<dyn DeviceBuffer>>;

    /// Allocator name for diagnostics
    fn name(&self) -> &str;
}
