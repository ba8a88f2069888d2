//! Batched view over several KV caches for one decode dispatch

use crate::blocks::KvPool;
use crate::cache::handle::{KvCache, TokenSlot};
use std::sync::Arc;
use tessera_interfaces::{CompletionFence, PagedKvLayout};
use tessera_types::{BlockIndex, Result, TesseraError};
use tracing::trace;

/// Read-only snapshot of an ordered list of caches in the block-table
/// layout decode kernels consume.
///
/// Slot `i` corresponds to row `i` of the query tensor. The view borrows
/// its caches, so none of them can grow or be released while it exists;
/// rebuild it after appending tokens. It never allocates or frees blocks.
#[derive(Debug)]
pub struct BatchedKvCache<'c, 'p> {
    pool: &'p KvPool,
    caches: Vec<&'c KvCache<'p>>,
    indptr: Vec<u32>,
    indices: Vec<u32>,
    last_page_len: Vec<u32>,
    seq_lens: Vec<u32>,
}

impl<'c, 'p> BatchedKvCache<'c, 'p> {
    /// Build the view. Every cache must come from the same pool and the
    /// batch must not be empty; anything else is a precondition violation.
    pub fn new<I>(caches: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'c KvCache<'p>>,
        'p: 'c,
    {
        let caches: Vec<&'c KvCache<'p>> = caches.into_iter().collect();
        let first = caches
            .first()
            .ok_or_else(|| TesseraError::precondition("cannot batch zero caches"))?;
        let pool = first.pool();

        let mut indptr = Vec::with_capacity(caches.len() + 1);
        let mut indices = Vec::with_capacity(caches.iter().map(|c| c.num_blocks()).sum());
        let mut last_page_len = Vec::with_capacity(caches.len());
        let mut seq_lens = Vec::with_capacity(caches.len());
        indptr.push(0u32);

        for (slot, cache) in caches.iter().enumerate() {
            if !std::ptr::eq(cache.pool(), pool) {
                let detail = pool
                    .config()
                    .geometry_mismatch(cache.pool().config())
                    .unwrap_or_else(|| "same geometry".to_string());
                return Err(TesseraError::precondition(format!(
                    "slot {slot} belongs to {} but the batch uses {} ({detail})",
                    cache.pool().id(),
                    pool.id()
                )));
            }
            let len = u32::try_from(cache.len()).map_err(|_| {
                TesseraError::precondition(format!(
                    "slot {slot} length {} exceeds the kernel index range",
                    cache.len()
                ))
            })?;

            indices.extend(cache.blocks().iter().map(|b| b.get()));
            indptr.push(indices.len() as u32);
            last_page_len.push(cache.last_block_fill() as u32);
            seq_lens.push(len);
        }

        trace!(
            "{}: batched {} caches over {} blocks",
            pool.id(),
            caches.len(),
            indices.len()
        );

        Ok(Self {
            pool,
            caches,
            indptr,
            indices,
            last_page_len,
            seq_lens,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    /// Sequence length of `slot`.
    ///
    /// # Panics
    /// If `slot >= batch_size()`.
    pub fn length_at(&self, slot: usize) -> usize {
        self.seq_lens[slot] as usize
    }

    /// Block indices of `slot`, in sequence order.
    ///
    /// # Panics
    /// If `slot >= batch_size()`.
    pub fn blocks_at(&self, slot: usize) -> &[u32] {
        let start = self.indptr[slot] as usize;
        let end = self.indptr[slot + 1] as usize;
        &self.indices[start..end]
    }

    /// Owning block and intra-block slot for `position` of `slot`
    pub fn locate(&self, slot: usize, position: usize) -> Option<TokenSlot> {
        if slot >= self.batch_size() || position >= self.length_at(slot) {
            return None;
        }
        let block_len = self.pool.block_len();
        let block = self.blocks_at(slot)[position / block_len];
        Some(TokenSlot {
            position,
            block: BlockIndex::new(block),
            offset: position % block_len,
        })
    }

    /// Longest block list in the batch
    pub fn max_blocks_per_seq(&self) -> usize {
        self.indptr
            .windows(2)
            .map(|w| (w[1] - w[0]) as usize)
            .max()
            .unwrap_or(0)
    }

    /// Row-major `[batch_size, max_blocks_per_seq]` block table with short
    /// rows filled with `pad`
    pub fn padded_block_table(&self, pad: u32) -> Vec<u32> {
        let width = self.max_blocks_per_seq();
        let mut table = Vec::with_capacity(self.batch_size() * width);
        for slot in 0..self.batch_size() {
            let blocks = self.blocks_at(slot);
            table.extend_from_slice(blocks);
            table.extend(std::iter::repeat(pad).take(width - blocks.len()));
        }
        table
    }

    /// Sum of all sequence lengths
    pub fn total_tokens(&self) -> usize {
        self.seq_lens.iter().map(|&l| l as usize).sum()
    }

    pub fn indptr(&self) -> &[u32] {
        &self.indptr
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn last_page_len(&self) -> &[u32] {
        &self.last_page_len
    }

    pub fn seq_lens(&self) -> &[u32] {
        &self.seq_lens
    }

    pub fn pool(&self) -> &'p KvPool {
        self.pool
    }

    /// Kernel-facing view over this batch and the pool's Block Store
    pub fn as_layout(&self) -> PagedKvLayout<'_> {
        PagedKvLayout {
            config: self.pool.config(),
            store: self.pool.store().buffer(),
            indptr: &self.indptr,
            indices: &self.indices,
            last_page_len: &self.last_page_len,
            seq_lens: &self.seq_lens,
        }
    }

    /// Record a dispatch issued with this batch on every member cache, so
    /// releasing any of them waits for it.
    pub fn track(&self, fence: Arc<dyn CompletionFence>) {
        for cache in &self.caches {
            cache.track_fence(fence.clone());
        }
    }
}
