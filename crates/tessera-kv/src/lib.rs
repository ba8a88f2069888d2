//! # Tessera KV
//!
//! Paged KV cache management for single-token decode over growing
//! sequences.
//!
//! - [`KvPool`] owns a preallocated Block Store and hands out fixed-size
//!   blocks by index.
//! - [`KvCache`] is one sequence's ordered block list plus its length; it
//!   grows one token at a time and allocates lazily at block boundaries.
//! - [`BatchedKvCache`] lays several caches out as one block table for a
//!   decode kernel without copying or padding block contents.
//!
//! ```
//! use tessera_kv::{BatchedKvCache, DataType, Device, KvCache, KvPool, KvPoolConfig};
//!
//! let pool = KvPool::on_host(KvPoolConfig {
//!     num_layers: 1,
//!     num_heads: 4,
//!     head_dim: 8,
//!     block_len: 16,
//!     capacity: 4,
//!     dtype: DataType::FP16,
//!     device: Device::CPU,
//! })?;
//!
//! let mut a = KvCache::new(&pool, 20)?;
//! let b = KvCache::new(&pool, 5)?;
//! a.append_token()?;
//!
//! let batch = BatchedKvCache::new([&a, &b])?;
//! assert_eq!(batch.length_at(0), 21);
//! assert_eq!(batch.blocks_at(0).len(), 2);
//! drop(batch);
//!
//! a.release()?;
//! b.release()?;
//! assert_eq!(pool.free_count(), 4);
//! # Ok::<(), tessera_kv::TesseraError>(())
//! ```

pub mod blocks;
pub mod cache;
pub mod dispatch;

pub use blocks::*;
pub use cache::*;
pub use dispatch::{dispatch_decode, PendingDecode};

pub use tessera_interfaces::{
    BatchTensor, CompletionFence, DecodeKernel, DecodeLaunch, DeviceAllocator, DeviceBuffer,
    HostEvent, PagedKvLayout, ReadyFence,
};
pub use tessera_types::{
    BlockIndex, CacheId, DataType, Device, KvPoolConfig, PoolId, Result, TesseraError,
};
