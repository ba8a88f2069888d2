//! Core type definitions for the tessera paged KV cache
//!
//! This crate contains the identifiers, device descriptions, pool
//! configuration and error definitions shared by the interface and KV
//! crates. It is kept lightweight to avoid circular dependencies.

pub mod config;
pub mod devices;
pub mod errors;
pub mod ids;

// Re-export commonly used types
pub use config::*;
pub use devices::*;
pub use errors::*;
pub use ids::*;

/// Result type used throughout tessera
pub type Result<T> = std::result::Result<T, TesseraError>;
