//! Block pool: exclusive authority over block lifetime

use crate::blocks::host::HostAllocator;
use crate::blocks::store::BlockStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tessera_interfaces::DeviceAllocator;
use tessera_types::{BlockIndex, CacheId, KvPoolConfig, PoolId, Result, TesseraError};
use tracing::{debug, trace, warn};

/// Free list plus a per-block ownership bitmap for O(1) double-free checks
#[derive(Debug)]
struct FreeList {
    stack: Vec<BlockIndex>,
    is_free: Vec<bool>,
}

impl FreeList {
    fn new(capacity: usize) -> Self {
        // Reversed so a fresh pool hands out blocks in ascending order
        Self {
            stack: (0..capacity as u32).rev().map(BlockIndex::new).collect(),
            is_free: vec![true; capacity],
        }
    }

    fn pop(&mut self) -> Option<BlockIndex> {
        let block = self.stack.pop()?;
        self.is_free[block.as_usize()] = false;
        Some(block)
    }

    fn push(&mut self, block: BlockIndex) {
        self.is_free[block.as_usize()] = true;
        self.stack.push(block);
    }

    fn check_owned(&self, block: BlockIndex) -> Result<()> {
        match self.is_free.get(block.as_usize()) {
            None => Err(TesseraError::precondition(format!(
                "block {block} out of range for capacity {}",
                self.is_free.len()
            ))),
            Some(true) => Err(TesseraError::precondition(format!(
                "block {block} is already free"
            ))),
            Some(false) => Ok(()),
        }
    }
}

/// Fixed-capacity pool of KV blocks.
///
/// Every block index is at any time either on the free list or owned by
/// exactly one [`KvCache`](crate::KvCache). The pool never grows: running
/// out is reported as `PoolExhausted`, because resizing would relocate
/// blocks that in-flight kernels may still be reading.
///
/// The free list sits behind a mutex so the pool can be shared by
/// reference, but it expects a single serving loop to drive allocation.
pub struct KvPool {
    id: PoolId,
    store: BlockStore,
    free: Mutex<FreeList>,
    next_cache_id: AtomicU64,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
    allocation_failures: AtomicUsize,
}

impl KvPool {
    /// Create a pool and allocate its Block Store through `allocator`
    pub fn new(config: KvPoolConfig, allocator: &dyn DeviceAllocator) -> Result<Self> {
        config.validate()?;

        let capacity = config.capacity;
        let store = BlockStore::new(config, allocator)?;
        let id = PoolId::next();

        debug!(
            "Creating KV pool {}: capacity={}, block_len={}, num_layers={}, num_heads={}, head_dim={}, dtype={}, device={}",
            id,
            capacity,
            store.config().block_len,
            store.config().num_layers,
            store.config().num_heads,
            store.config().head_dim,
            store.config().dtype,
            store.config().device
        );

        Ok(Self {
            id,
            store,
            free: Mutex::new(FreeList::new(capacity)),
            next_cache_id: AtomicU64::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
            allocation_failures: AtomicUsize::new(0),
        })
    }

    /// Create a pool whose Block Store lives in host memory
    pub fn on_host(config: KvPoolConfig) -> Result<Self> {
        Self::new(config, &HostAllocator::new())
    }

    /// Pop one block from the free list
    pub fn allocate_block(&self) -> Result<BlockIndex> {
        let mut free = self.free.lock();
        match free.pop() {
            Some(block) => {
                self.total_allocations.fetch_add(1, Ordering::Relaxed);
                trace!("{}: allocated block {}", self.id, block);
                Ok(block)
            }
            None => {
                self.allocation_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}: exhausted, no free blocks", self.id);
                Err(TesseraError::pool_exhausted(1, 0))
            }
        }
    }

    /// Allocate `count` blocks, all or nothing
    pub fn allocate_blocks(&self, count: usize) -> Result<Vec<BlockIndex>> {
        let mut free = self.free.lock();
        let available = free.stack.len();
        if available < count {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: exhausted, need {} blocks, only {} free",
                self.id, count, available
            );
            return Err(TesseraError::pool_exhausted(count, available));
        }

        // Same order as `count` successive pops
        let start = available - count;
        let blocks: Vec<BlockIndex> = free.stack.drain(start..).rev().collect();
        for block in &blocks {
            free.is_free[block.as_usize()] = false;
        }
        self.total_allocations.fetch_add(count, Ordering::Relaxed);
        trace!("{}: allocated blocks {:?}", self.id, blocks);
        Ok(blocks)
    }

    /// Return one block to the free list.
    ///
    /// Freeing a block that is already free or out of range is a
    /// precondition violation: it means block ownership was corrupted.
    pub fn free_block(&self, block: BlockIndex) -> Result<()> {
        let mut free = self.free.lock();
        if let Err(err) = free.check_owned(block) {
            warn!("{}: rejected free of {}: {}", self.id, block, err);
            return Err(err);
        }
        free.push(block);
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        trace!("{}: freed block {}", self.id, block);
        Ok(())
    }

    /// Return several blocks in one pass. Nothing is freed if any index is
    /// invalid or repeated.
    pub fn free_blocks(&self, blocks: &[BlockIndex]) -> Result<()> {
        let mut free = self.free.lock();
        for (i, &block) in blocks.iter().enumerate() {
            let result = free.check_owned(block).and_then(|_| {
                if blocks[..i].contains(&block) {
                    Err(TesseraError::precondition(format!(
                        "block {block} listed twice in one free"
                    )))
                } else {
                    Ok(())
                }
            });
            if let Err(err) = result {
                warn!("{}: rejected free of {:?}: {}", self.id, blocks, err);
                return Err(err);
            }
        }

        // Reverse push undoes `allocate_blocks`, restoring the stack order
        for &block in blocks.iter().rev() {
            free.push(block);
        }
        self.total_deallocations
            .fetch_add(blocks.len(), Ordering::Relaxed);
        trace!("{}: freed blocks {:?}", self.id, blocks);
        Ok(())
    }

    /// Whether `block` is currently on the free list
    pub fn is_free(&self, block: BlockIndex) -> bool {
        self.free
            .lock()
            .is_free
            .get(block.as_usize())
            .copied()
            .unwrap_or(false)
    }

    /// Number of blocks on the free list
    pub fn free_count(&self) -> usize {
        self.free.lock().stack.len()
    }

    /// Number of blocks owned by caches
    pub fn used_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// Whether `num_tokens` more tokens worth of blocks could be allocated now
    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        self.free_count() >= self.config().blocks_for_len(num_tokens)
    }

    pub fn capacity(&self) -> usize {
        self.store.config().capacity
    }

    pub fn block_len(&self) -> usize {
        self.store.config().block_len
    }

    pub fn config(&self) -> &KvPoolConfig {
        self.store.config()
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The Block Store backing every block of this pool
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub(crate) fn next_cache_id(&self) -> CacheId {
        CacheId(self.next_cache_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Get statistics
    pub fn stats(&self) -> BlockPoolStats {
        let free_blocks = self.free_count();
        BlockPoolStats {
            capacity: self.capacity(),
            free_blocks,
            allocated_blocks: self.capacity() - free_blocks,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for KvPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("block_len", &self.block_len())
            .field("free_blocks", &self.free_count())
            .finish()
    }
}

/// Block pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPoolStats {
    pub capacity: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
    pub allocation_failures: usize,
}

impl BlockPoolStats {
    /// Get utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.allocated_blocks as f32 / self.capacity as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{DataType, Device};

    fn pool(capacity: usize) -> KvPool {
        KvPool::on_host(KvPoolConfig {
            num_layers: 1,
            num_heads: 2,
            head_dim: 4,
            block_len: 16,
            capacity,
            dtype: DataType::FP16,
            device: Device::CPU,
        })
        .unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool(8);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.block_len(), 16);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = KvPool::on_host(KvPoolConfig {
            num_layers: 1,
            num_heads: 2,
            head_dim: 4,
            block_len: 16,
            capacity: 0,
            dtype: DataType::FP16,
            device: Device::CPU,
        })
        .unwrap_err();
        assert!(matches!(err, TesseraError::Config { .. }));
    }

    #[test]
    fn test_fresh_pool_allocates_in_order() {
        let pool = pool(3);
        assert_eq!(pool.allocate_block().unwrap(), BlockIndex::new(0));
        assert_eq!(pool.allocate_block().unwrap(), BlockIndex::new(1));
        assert_eq!(pool.allocate_block().unwrap(), BlockIndex::new(2));
    }

    #[test]
    fn test_block_reuse() {
        let pool = pool(4);
        let a = pool.allocate_block().unwrap();
        pool.free_block(a).unwrap();
        assert!(pool.is_free(a));

        let b = pool.allocate_block().unwrap();
        assert_eq!(a, b);
        assert!(!pool.is_free(b));
    }

    #[test]
    fn test_exhaustion_leaves_free_list_unchanged() {
        let pool = pool(1);
        let _ = pool.allocate_block().unwrap();
        assert_eq!(pool.free_count(), 0);

        let err = pool.allocate_block().unwrap_err();
        assert_eq!(err, TesseraError::pool_exhausted(1, 0));
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.stats().allocation_failures, 1);
    }

    #[test]
    fn test_allocate_blocks_all_or_nothing() {
        let pool = pool(4);
        let _held = pool.allocate_blocks(2).unwrap();

        let err = pool.allocate_blocks(3).unwrap_err();
        assert_eq!(err, TesseraError::pool_exhausted(3, 2));
        assert_eq!(pool.free_count(), 2);

        assert!(pool.allocate_blocks(0).unwrap().is_empty());
    }

    #[test]
    fn test_double_free_rejected() {
        let pool = pool(2);
        let a = pool.allocate_block().unwrap();
        pool.free_block(a).unwrap();

        let err = pool.free_block(a).unwrap_err();
        assert!(err.is_precondition_violation());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_out_of_range_free_rejected() {
        let pool = pool(2);
        let err = pool.free_block(BlockIndex::new(2)).unwrap_err();
        assert!(err.is_precondition_violation());
        assert!(!pool.is_free(BlockIndex::new(2)));
    }

    #[test]
    fn test_free_blocks_validates_before_mutating() {
        let pool = pool(4);
        let blocks = pool.allocate_blocks(3).unwrap();

        // Repeated index
        let err = pool
            .free_blocks(&[blocks[0], blocks[1], blocks[0]])
            .unwrap_err();
        assert!(err.is_precondition_violation());
        assert_eq!(pool.free_count(), 1);

        // Already-free index in the middle
        let free_one = BlockIndex::new(3);
        assert!(pool.is_free(free_one));
        assert!(pool.free_blocks(&[blocks[0], free_one]).is_err());
        assert_eq!(pool.free_count(), 1);

        pool.free_blocks(&blocks).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_can_allocate() {
        let pool = pool(2);
        assert!(pool.can_allocate(32));
        assert!(!pool.can_allocate(33));
    }

    #[test]
    fn test_stats() {
        let pool = pool(4);
        let blocks = pool.allocate_blocks(2).unwrap();
        pool.free_block(blocks[0]).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.free_blocks, 3);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 1);
        assert!((stats.utilization() - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pool_ids_are_distinct() {
        assert_ne!(pool(1).id(), pool(1).id());
    }
}
