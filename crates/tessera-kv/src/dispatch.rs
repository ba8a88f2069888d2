//! Decode dispatch: validates a query batch against a KV batch, launches
//! the kernel and ties the launch's fence to every cache it reads.

use crate::cache::BatchedKvCache;
use std::sync::Arc;
use tessera_interfaces::{BatchTensor, CompletionFence, DecodeKernel};
use tessera_types::{Result, TesseraError};
use tracing::debug;

/// A decode step that has been issued but may not have finished
#[derive(Debug)]
pub struct PendingDecode {
    output: BatchTensor,
    fence: Arc<dyn CompletionFence>,
}

impl PendingDecode {
    pub fn is_complete(&self) -> bool {
        self.fence.is_complete()
    }

    pub fn fence(&self) -> &Arc<dyn CompletionFence> {
        &self.fence
    }

    /// Wait for the kernel and hand out its output
    pub fn wait(self) -> Result<BatchTensor> {
        self.fence.wait()?;
        Ok(self.output)
    }
}

/// Issue one decode step of `layer_index` for every slot of `batch`.
///
/// `query` must be `[batch.batch_size(), num_heads, head_dim]` in the
/// pool's dtype and on the pool's device. Kernel errors are returned as
/// the kernel reported them.
pub fn dispatch_decode(
    kernel: &dyn DecodeKernel,
    query: &BatchTensor,
    batch: &BatchedKvCache<'_, '_>,
    layer_index: usize,
) -> Result<PendingDecode> {
    let config = batch.pool().config();

    if query.batch_size != batch.batch_size() {
        return Err(TesseraError::precondition(format!(
            "query batch {} does not match kv batch {}",
            query.batch_size,
            batch.batch_size()
        )));
    }
    if query.num_heads != config.num_heads || query.head_dim != config.head_dim {
        return Err(TesseraError::precondition(format!(
            "query heads [{}, {}] do not match pool heads [{}, {}]",
            query.num_heads, query.head_dim, config.num_heads, config.head_dim
        )));
    }
    if query.dtype != config.dtype {
        return Err(TesseraError::precondition(format!(
            "query dtype {} does not match pool dtype {}",
            query.dtype, config.dtype
        )));
    }
    if query.buffer.device() != &config.device {
        return Err(TesseraError::precondition(format!(
            "query lives on {}, kv cache on {}",
            query.buffer.device(),
            config.device
        )));
    }
    if layer_index >= config.num_layers {
        return Err(TesseraError::precondition(format!(
            "layer {layer_index} out of range for {} layers",
            config.num_layers
        )));
    }

    debug!(
        "Dispatching {} decode: batch={}, layer={}, tokens={}",
        kernel.name(),
        batch.batch_size(),
        layer_index,
        batch.total_tokens()
    );

    let launch = kernel.decode(query, &batch.as_layout(), layer_index)?;
    batch.track(launch.fence.clone());

    if launch.output.shape() != query.shape() {
        return Err(TesseraError::kernel(format!(
            "{} returned output of shape {:?} for query {:?}",
            kernel.name(),
            launch.output.shape(),
            query.shape()
        )));
    }

    Ok(PendingDecode {
        output: launch.output,
        fence: launch.fence,
    })
}
