//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Once;
use tessera_kv::{DataType, Device, KvPool, KvPoolConfig};

static TEST_INIT: Once = Once::new();

/// Initialize tracing once for all tests in a binary
pub fn init_test_env() {
    TEST_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "error".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn config(capacity: usize, block_len: usize) -> KvPoolConfig {
    KvPoolConfig {
        num_layers: 2,
        num_heads: 4,
        head_dim: 8,
        block_len,
        capacity,
        dtype: DataType::FP16,
        device: Device::CPU,
    }
}

pub fn host_pool(capacity: usize, block_len: usize) -> KvPool {
    init_test_env();
    KvPool::on_host(config(capacity, block_len)).expect("host pool")
}
