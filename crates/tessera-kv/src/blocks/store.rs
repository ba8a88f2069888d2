//! Block Store: the preallocated region all KV blocks live in
//!
//! Shaped `[capacity, num_layers, 2, num_heads, block_len, head_dim]`.
//! Everything outside this module addresses it by [`BlockIndex`] only.

use tessera_interfaces::{DeviceAllocator, DeviceBuffer};
use tessera_types::{BlockIndex, KvPoolConfig, Result, TesseraError};
use tracing::debug;

/// Key or value plane of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvPart {
    Key = 0,
    Value = 1,
}

/// Flat preallocated storage for `capacity` blocks
#[derive(Debug)]
pub struct BlockStore {
    config: KvPoolConfig,
    buffer: Box<dyn DeviceBuffer>,
}

impl BlockStore {
    /// Allocate the whole region in one request
    pub fn new(config: KvPoolConfig, allocator: &dyn DeviceAllocator) -> Result<Self> {
        config.validate()?;
        let bytes = config.store_bytes()?;
        let buffer = allocator.allocate(bytes, config.dtype, &config.device)?;
        if buffer.len_bytes() < bytes {
            return Err(TesseraError::allocation(format!(
                "{} returned {} bytes, block store needs {}",
                allocator.name(),
                buffer.len_bytes(),
                bytes
            )));
        }
        if buffer.device() != &config.device {
            return Err(TesseraError::device(format!(
                "{} placed block store on {}, requested {}",
                allocator.name(),
                buffer.device(),
                config.device
            )));
        }

        debug!(
            "Allocated block store: {} blocks x {} bytes on {} via {}",
            config.capacity,
            bytes / config.capacity,
            config.device,
            allocator.name()
        );

        Ok(Self { config, buffer })
    }

    pub fn config(&self) -> &KvPoolConfig {
        &self.config
    }

    /// Backing device memory
    pub fn buffer(&self) -> &dyn DeviceBuffer {
        self.buffer.as_ref()
    }

    /// Elements between two consecutive blocks
    pub fn block_stride(&self) -> usize {
        self.config.num_layers * 2 * self.config.elements_per_plane()
    }

    /// Element offset of the first element of `block`
    pub fn block_offset(&self, block: BlockIndex) -> Result<usize> {
        self.check_block(block)?;
        Ok(block.as_usize() * self.block_stride())
    }

    /// Element offset of the K or V plane of `layer` inside `block`
    pub fn plane_offset(&self, block: BlockIndex, layer: usize, part: KvPart) -> Result<usize> {
        if layer >= self.config.num_layers {
            return Err(TesseraError::precondition(format!(
                "layer {layer} out of range for {} layers",
                self.config.num_layers
            )));
        }
        let plane = self.config.elements_per_plane();
        Ok(self.block_offset(block)? + (layer * 2 + part as usize) * plane)
    }

    /// Element offset of the `head_dim` vector for (`head`, `slot`)
    pub fn offset_of(
        &self,
        block: BlockIndex,
        layer: usize,
        part: KvPart,
        head: usize,
        slot: usize,
    ) -> Result<usize> {
        if head >= self.config.num_heads {
            return Err(TesseraError::precondition(format!(
                "head {head} out of range for {} heads",
                self.config.num_heads
            )));
        }
        if slot >= self.config.block_len {
            return Err(TesseraError::precondition(format!(
                "slot {slot} out of range for block_len {}",
                self.config.block_len
            )));
        }
        let base = self.plane_offset(block, layer, part)?;
        Ok(base + (head * self.config.block_len + slot) * self.config.head_dim)
    }

    /// Convert an element offset to a byte offset
    pub fn byte_offset(&self, element_offset: usize) -> usize {
        element_offset * self.config.dtype.size_bytes()
    }

    fn check_block(&self, block: BlockIndex) -> Result<()> {
        if block.as_usize() >= self.config.capacity {
            return Err(TesseraError::precondition(format!(
                "block {block} out of range for capacity {}",
                self.config.capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::host::HostAllocator;
    use tessera_types::{DataType, Device};

    fn config() -> KvPoolConfig {
        KvPoolConfig {
            num_layers: 2,
            num_heads: 3,
            head_dim: 4,
            block_len: 5,
            capacity: 6,
            dtype: DataType::FP16,
            device: Device::CPU,
        }
    }

    #[test]
    fn test_store_size() {
        let store = BlockStore::new(config(), &HostAllocator::new()).unwrap();
        assert_eq!(store.buffer().len_bytes(), 6 * 2 * 2 * 3 * 5 * 4 * 2);
        assert_eq!(store.block_stride(), 2 * 2 * 3 * 5 * 4);
    }

    #[test]
    fn test_offsets_follow_layout() {
        let store = BlockStore::new(config(), &HostAllocator::new()).unwrap();
        let plane = 3 * 5 * 4;
        let block = BlockIndex::new(2);

        assert_eq!(store.block_offset(block).unwrap(), 2 * 4 * plane);
        assert_eq!(
            store.plane_offset(block, 1, KvPart::Value).unwrap(),
            2 * 4 * plane + 3 * plane
        );
        assert_eq!(
            store.offset_of(block, 1, KvPart::Key, 2, 3).unwrap(),
            2 * 4 * plane + 2 * plane + (2 * 5 + 3) * 4
        );
        assert_eq!(store.byte_offset(10), 20);
    }

    #[test]
    fn test_last_element_fits() {
        let store = BlockStore::new(config(), &HostAllocator::new()).unwrap();
        let last = store
            .offset_of(BlockIndex::new(5), 1, KvPart::Value, 2, 4)
            .unwrap();
        assert_eq!(last + 4, store.buffer().len_elements());
    }

    #[test]
    fn test_out_of_range_is_precondition() {
        let store = BlockStore::new(config(), &HostAllocator::new()).unwrap();
        assert!(store
            .block_offset(BlockIndex::new(6))
            .unwrap_err()
            .is_precondition_violation());
        assert!(store
            .plane_offset(BlockIndex::new(0), 2, KvPart::Key)
            .is_err());
        assert!(store
            .offset_of(BlockIndex::new(0), 0, KvPart::Key, 3, 0)
            .is_err());
        assert!(store
            .offset_of(BlockIndex::new(0), 0, KvPart::Key, 0, 5)
            .is_err());
    }

    /// Ignores the requested device and always hands out host memory
    struct MisplacingAllocator;

    impl DeviceAllocator for MisplacingAllocator {
        fn allocate(
            &self,
            bytes: usize,
            dtype: DataType,
            _device: &Device,
        ) -> Result<Box<dyn DeviceBuffer>> {
            HostAllocator::new().allocate(bytes, dtype, &Device::CPU)
        }

        fn name(&self) -> &str {
            "misplacing"
        }
    }

    #[test]
    fn test_wrong_device_is_device_error() {
        let mut cfg = config();
        cfg.device = Device::CUDA(0);
        let err = BlockStore::new(cfg, &MisplacingAllocator).unwrap_err();
        assert!(matches!(err, TesseraError::Device { .. }));
    }
}
