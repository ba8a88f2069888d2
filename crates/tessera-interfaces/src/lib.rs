//! Interface definitions between the tessera KV core and its collaborators
//!
//! The KV core manages block bookkeeping only. Device memory, the decode
//! kernel and completion tracking of asynchronously issued work are reached
//! through the traits defined here:
//! - [`DeviceAllocator`] / [`DeviceBuffer`] for the Block Store's memory
//! - [`DecodeKernel`] for the fused rotary + attention decode step
//! - [`CompletionFence`] for waiting on in-flight dispatches

pub mod kernel;
pub mod memory;
pub mod sync;

pub use kernel::{BatchTensor, DecodeKernel, DecodeLaunch, PagedKvLayout};
pub use memory::{DeviceAllocator, DeviceBuffer};
pub use sync::{CompletionFence, HostEvent, ReadyFence};

pub use tessera_types::{DataType, Device, KvPoolConfig, Result, TesseraError};
