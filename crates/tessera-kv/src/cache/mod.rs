pub mod batch;
pub mod handle;

pub use batch::BatchedKvCache;
pub use handle::{KvCache, TokenSlot};
