pub mod host;
pub mod pool;
pub mod store;

pub use host::{HostAllocator, HostBuffer};
pub use pool::{BlockPoolStats, KvPool};
pub use store::{BlockStore, KvPart};
