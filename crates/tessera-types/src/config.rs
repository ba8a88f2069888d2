//! Pool configuration

use crate::{DataType, Device, Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Geometry and placement of a KV block pool.
///
/// Every field is required. The Block Store is shaped
/// `capacity × num_layers × 2 × num_heads × block_len × head_dim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPoolConfig {
    /// Number of transformer layers cached per block
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Head dimension
    pub head_dim: usize,
    /// Token slots per block
    pub block_len: usize,
    /// Total number of blocks in the pool
    pub capacity: usize,
    /// Element type
    pub dtype: DataType,
    /// Device holding the Block Store
    pub device: Device,
}

impl KvPoolConfig {
    /// Reject zero-sized dimensions and a zero capacity
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("head_dim", self.head_dim),
            ("block_len", self.block_len),
            ("capacity", self.capacity),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(TesseraError::config(format!("{name} must be positive")));
            }
        }
        if self.capacity > u32::MAX as usize {
            return Err(TesseraError::config(format!(
                "capacity {} exceeds the block index range",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Blocks needed to hold `len` tokens: `ceil(len / block_len)`
    pub fn blocks_for_len(&self, len: usize) -> usize {
        len.div_ceil(self.block_len)
    }

    /// Total block demand of a set of sequences, i.e. the smallest capacity
    /// that fits them all at once.
    pub fn capacity_for_lengths(&self, lengths: &[usize]) -> usize {
        lengths.iter().map(|&len| self.blocks_for_len(len)).sum()
    }

    /// Elements in one K or V plane of one layer inside a block
    pub fn elements_per_plane(&self) -> usize {
        self.num_heads * self.block_len * self.head_dim
    }

    /// Elements in one block across all layers and both K and V
    pub fn elements_per_block(&self) -> Option<usize> {
        self.num_layers
            .checked_mul(2)?
            .checked_mul(self.num_heads)?
            .checked_mul(self.block_len)?
            .checked_mul(self.head_dim)
    }

    /// Bytes in one block
    pub fn bytes_per_block(&self) -> Option<usize> {
        self.elements_per_block()?.checked_mul(self.dtype.size_bytes())
    }

    /// Bytes of the whole Block Store
    pub fn store_bytes(&self) -> Result<usize> {
        self.bytes_per_block()
            .and_then(|b| b.checked_mul(self.capacity))
            .ok_or_else(|| {
                TesseraError::allocation(format!(
                    "block store size overflows: capacity={} num_layers={} num_heads={} block_len={} head_dim={} dtype={}",
                    self.capacity,
                    self.num_layers,
                    self.num_heads,
                    self.block_len,
                    self.head_dim,
                    self.dtype
                ))
            })
    }

    /// Whether two pools lay out their blocks identically.
    /// Capacity is not part of the block geometry.
    pub fn same_geometry(&self, other: &KvPoolConfig) -> bool {
        self.num_layers == other.num_layers
            && self.num_heads == other.num_heads
            && self.head_dim == other.head_dim
            && self.block_len == other.block_len
            && self.dtype == other.dtype
            && self.device == other.device
    }

    /// Human readable description of the first geometry mismatch
    pub fn geometry_mismatch(&self, other: &KvPoolConfig) -> Option<String> {
        if self.block_len != other.block_len {
            return Some(format!("block_len {} vs {}", self.block_len, other.block_len));
        }
        if self.num_layers != other.num_layers {
            return Some(format!("num_layers {} vs {}", self.num_layers, other.num_layers));
        }
        if self.num_heads != other.num_heads {
            return Some(format!("num_heads {} vs {}", self.num_heads, other.num_heads));
        }
        if self.head_dim != other.head_dim {
            return Some(format!("head_dim {} vs {}", self.head_dim, other.head_dim));
        }
        if self.dtype != other.dtype {
            return Some(format!("dtype {} vs {}", self.dtype, other.dtype));
        }
        if self.device != other.device {
            return Some(format!("device {} vs {}", self.device, other.device));
        }
        None
    }
}
