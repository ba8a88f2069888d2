//! Identifier types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of one block inside the Block Store.
///
/// Blocks are addressed by index only, never by raw offset, so handing a
/// block to another sequence is pure bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for BlockIndex {
    fn from(value: u32) -> Self {
        BlockIndex(value)
    }
}

impl From<BlockIndex> for u32 {
    fn from(value: BlockIndex) -> Self {
        value.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique pool identity
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u64);

impl PoolId {
    /// Allocate a fresh id, never handed out twice within a process
    pub fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Per-pool cache handle id, used for log correlation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheId(pub u64);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv-{}", self.0)
    }
}
