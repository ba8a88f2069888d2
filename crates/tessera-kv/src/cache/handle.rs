//! Per-sequence KV cache handle

use crate::blocks::KvPool;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tessera_interfaces::CompletionFence;
use tessera_types::{BlockIndex, CacheId, Result, TesseraError};
use tracing::{debug, trace, warn};

/// Where one token's K/V lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSlot {
    /// Logical position in the sequence
    pub position: usize,
    /// Block holding the position
    pub block: BlockIndex,
    /// Slot inside the block
    pub offset: usize,
}

/// One sequence's KV history: an ordered list of pool blocks plus the
/// number of valid token positions.
///
/// Invariant: `blocks.len() == ceil(length / block_len)`. All blocks but
/// the last are full; the last holds `length % block_len` tokens, or is
/// full when that is zero.
///
/// The handle borrows its pool, so the pool must outlive it. `release`
/// consumes the handle; dropping an unreleased handle releases it too.
#[derive(Debug)]
pub struct KvCache<'p> {
    pool: &'p KvPool,
    id: CacheId,
    blocks: SmallVec<[BlockIndex; 8]>,
    length: usize,
    /// Dispatches issued against this cache that may still be reading it
    fences: Mutex<Vec<Arc<dyn CompletionFence>>>,
    /// First failure among dispatches already pruned from `fences`
    dispatch_error: Mutex<Option<TesseraError>>,
}

impl<'p> KvCache<'p> {
    /// Create a cache holding `initial_length` positions (e.g. after a
    /// prefill done elsewhere). Allocates `ceil(initial_length / block_len)`
    /// blocks up front; on `PoolExhausted` nothing is taken from the pool.
    pub fn new(pool: &'p KvPool, initial_length: usize) -> Result<Self> {
        let needed = pool.config().blocks_for_len(initial_length);
        let blocks = pool.allocate_blocks(needed)?;
        let id = pool.next_cache_id();

        debug!(
            "{}: created {} with length {} over {} block(s)",
            pool.id(),
            id,
            initial_length,
            blocks.len()
        );

        Ok(Self {
            pool,
            id,
            blocks: blocks.into_iter().collect(),
            length: initial_length,
            fences: Mutex::new(Vec::new()),
            dispatch_error: Mutex::new(None),
        })
    }

    /// Grow by one token, allocating a block first if the last one is full.
    ///
    /// All or nothing: on `PoolExhausted` the length is unchanged.
    pub fn append_token(&mut self) -> Result<TokenSlot> {
        let block_len = self.block_len();
        let position = self.length;
        let offset = position % block_len;

        if offset == 0 {
            let block = self.pool.allocate_block()?;
            trace!("{}: position {} opens block {}", self.id, position, block);
            self.blocks.push(block);
        }

        self.length += 1;
        Ok(TokenSlot {
            position,
            block: self.blocks[position / block_len],
            offset,
        })
    }

    /// Grow by `count` tokens, all or nothing
    pub fn append_tokens(&mut self, count: usize) -> Result<()> {
        let target = self.length.checked_add(count).ok_or_else(|| {
            TesseraError::precondition(format!(
                "{}: appending {} tokens to length {} overflows",
                self.id, count, self.length
            ))
        })?;
        let needed = self.pool.config().blocks_for_len(target) - self.blocks.len();
        if needed > 0 {
            let blocks = self.pool.allocate_blocks(needed)?;
            self.blocks.extend(blocks);
        }
        self.length = target;
        Ok(())
    }

    /// Return every block to the pool.
    ///
    /// Waits for all dispatches recorded against this cache first, so no
    /// block is reassigned while a kernel may still read it. Blocks are
    /// returned even if a dispatch failed; the first kernel error is
    /// reported afterwards.
    pub fn release(mut self) -> Result<()> {
        self.release_blocks()
    }

    fn release_blocks(&mut self) -> Result<()> {
        let fences = std::mem::take(&mut *self.fences.lock());
        let mut dispatch_error = self.dispatch_error.lock().take();
        for fence in fences {
            if let Err(err) = fence.wait() {
                dispatch_error.get_or_insert(err);
            }
        }

        if !self.blocks.is_empty() {
            self.pool.free_blocks(&self.blocks)?;
        }
        debug!(
            "{}: released {} ({} block(s), length {})",
            self.pool.id(),
            self.id,
            self.blocks.len(),
            self.length
        );
        self.blocks.clear();
        self.length = 0;

        match dispatch_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record a dispatch that reads this cache
    pub(crate) fn track_fence(&self, fence: Arc<dyn CompletionFence>) {
        let mut fences = self.fences.lock();
        let mut failed = None;
        fences.retain(|f| {
            if !f.is_complete() {
                return true;
            }
            if let Err(err) = f.wait() {
                failed.get_or_insert(err);
            }
            false
        });
        fences.push(fence);

        if let Some(err) = failed {
            self.dispatch_error.lock().get_or_insert(err);
        }
    }

    /// Number of recorded dispatches that have not completed yet
    pub fn pending_dispatches(&self) -> usize {
        self.fences.lock().iter().filter(|f| !f.is_complete()).count()
    }

    /// Block and intra-block slot of `position`, if it is valid
    pub fn slot_of(&self, position: usize) -> Option<TokenSlot> {
        if position >= self.length {
            return None;
        }
        let block_len = self.block_len();
        Some(TokenSlot {
            position,
            block: self.blocks[position / block_len],
            offset: position % block_len,
        })
    }

    /// Number of valid token positions
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn block_len(&self) -> usize {
        self.pool.block_len()
    }

    /// Owned blocks in sequence order
    pub fn blocks(&self) -> &[BlockIndex] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Tokens the owned blocks can hold without another allocation
    pub fn capacity_tokens(&self) -> usize {
        self.blocks.len() * self.block_len()
    }

    /// Valid slots in the last block, 0 when no block is owned
    pub fn last_block_fill(&self) -> usize {
        if self.length == 0 {
            0
        } else {
            (self.length - 1) % self.block_len() + 1
        }
    }

    pub fn pool(&self) -> &'p KvPool {
        self.pool
    }

    pub fn id(&self) -> CacheId {
        self.id
    }
}

impl Drop for KvCache<'_> {
    fn drop(&mut self) {
        if self.blocks.is_empty()
            && self.fences.get_mut().is_empty()
            && self.dispatch_error.get_mut().is_none()
        {
            return;
        }
        if let Err(err) = self.release_blocks() {
            warn!("{}: implicit release of {} failed: {}", self.pool.id(), self.id, err);
        }
    }
}
