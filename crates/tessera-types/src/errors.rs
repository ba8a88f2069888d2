//! Error types for the tessera KV cache

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for tessera operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum TesseraError {
    /// The device could not provide the Block Store's backing memory
    #[error("Allocation error: {message}")]
    Allocation { message: String },

    /// No free blocks left for an allocation request
    #[error("Pool exhausted: requested {requested} block(s), {available} available")]
    PoolExhausted { requested: usize, available: usize },

    /// Misuse of the API. Indicates a bug in the caller and must never be retried.
    #[error("Precondition violation: {message}")]
    PreconditionViolation { message: String },

    /// Error reported by the decode kernel, passed through untouched
    #[error("Kernel error: {message}")]
    Kernel { message: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Memory requested on, or returned from, the wrong device
    #[error("Device error: {message}")]
    Device { message: String },
}

impl TesseraError {
    /// Create an allocation error
    pub fn allocation(message: impl Into<String>) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(requested: usize, available: usize) -> Self {
        Self::PoolExhausted {
            requested,
            available,
        }
    }

    /// Create a precondition violation
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation {
            message: message.into(),
        }
    }

    /// Create a kernel error
    pub fn kernel(message: impl Into<String>) -> Self {
        Self::Kernel {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a device error
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    /// Whether the caller can recover, e.g. by evicting a sequence or
    /// retrying with a smaller pool.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Allocation { .. })
    }

    /// Check if this error reports API misuse
    pub fn is_precondition_violation(&self) -> bool {
        matches!(self, Self::PreconditionViolation { .. })
    }

    /// Check if this is a pool exhaustion error
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
