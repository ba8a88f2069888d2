//! Decode kernel boundary
//!
//! The fused rotary-embedding + multi-head-attention decode math lives
//! outside this workspace. Kernels see the KV cache only through a
//! [`PagedKvLayout`]: a CSR-style block table over the shared Block Store.
//! For slot `i`, its blocks are `indices[indptr[i]..indptr[i + 1]]`,
//! position `p` lives in block `indices[indptr[i] + p / block_len]` at
//! intra-block slot `p % block_len`.

use crate::memory::DeviceBuffer;
use crate::sync::CompletionFence;
use std::sync::Arc;
use tessera_types::{DataType, KvPoolConfig, Result, TesseraError};

/// Batch of one vector per (slot, head): shape `[batch_size, num_heads, head_dim]`
#[derive(Debug, Clone)]
pub struct BatchTensor {
    pub batch_size: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub dtype: DataType,
    pub buffer: Arc<dyn DeviceBuffer>,
}

impl BatchTensor {
    /// Wrap `buffer`, checking that it holds the full shape
    pub fn new(
        batch_size: usize,
        num_heads: usize,
        head_dim: usize,
        dtype: DataType,
        buffer: Arc<dyn DeviceBuffer>,
    ) -> Result<Self> {
        let needed = batch_size
            .checked_mul(num_heads)
            .and_then(|n| n.checked_mul(head_dim))
            .and_then(|n| n.checked_mul(dtype.size_bytes()))
            .ok_or_else(|| {
                TesseraError::precondition(format!(
                    "tensor [{batch_size}, {num_heads}, {head_dim}] {dtype} overflows usize"
                ))
            })?;
        if buffer.len_bytes() < needed {
            return Err(TesseraError::precondition(format!(
                "buffer of {} bytes cannot hold [{batch_size}, {num_heads}, {head_dim}] {dtype}",
                buffer.len_bytes()
            )));
        }
        if buffer.dtype() != dtype {
            return Err(TesseraError::precondition(format!(
                "buffer dtype {} does not match tensor dtype {dtype}",
                buffer.dtype()
            )));
        }
        Ok(Self {
            batch_size,
            num_heads,
            head_dim,
            dtype,
            buffer,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.batch_size, self.num_heads, self.head_dim]
    }
}

/// Borrowed block-table view of a batch, as consumed by a decode kernel
#[derive(Debug, Clone, Copy)]
pub struct PagedKvLayout<'a> {
    /// Geometry of the pool every slot draws from
    pub config: &'a KvPoolConfig,
    /// The Block Store
    pub store: &'a dyn DeviceBuffer,
    /// `batch_size + 1` offsets into `indices`
    pub indptr: &'a [u32],
    /// Block indices of all slots, concatenated in batch order
    pub indices: &'a [u32],
    /// Valid slots in each sequence's last block, 0 for an empty sequence
    pub last_page_len: &'a [u32],
    /// Current length of each sequence; drives the rotary position
    pub seq_lens: &'a [u32],
}

impl<'a> PagedKvLayout<'a> {
    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    /// Blocks owned by `slot`
    pub fn blocks(&self, slot: usize) -> &'a [u32] {
        let start = self.indptr[slot] as usize;
        let end = self.indptr[slot + 1] as usize;
        &self.indices[start..end]
    }
}

/// A launched decode: output buffer plus the fence that completes it
#[derive(Debug)]
pub struct DecodeLaunch {
    pub output: BatchTensor,
    pub fence: Arc<dyn CompletionFence>,
}

/// Decode kernel entry point
pub trait DecodeKernel: Send + Sync {
    /// Kernel name for diagnostics
    fn name(&self) -> &str;

    /// Issue one decode step for layer `layer_index`.
    ///
    /// Each slot's query attends only to that slot's own KV history, with
    /// rotary embedding keyed by the slot's sequence length. The call may
    /// return before the work finishes; the returned fence tracks it.
    /// Failures are reported as `TesseraError::Kernel`.
    fn decode(
        &self,
        query: &BatchTensor,
        kv: &PagedKvLayout<'_>,
        layer_index: usize,
    ) -> Result<DecodeLaunch>;
}
