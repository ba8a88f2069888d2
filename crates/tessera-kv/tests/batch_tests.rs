//! Batched view tests

mod common;

use common::{config, host_pool, init_test_env};
use tessera_kv::{BatchedKvCache, KvCache, KvPool};

#[test]
fn test_lengths_and_blocks_per_slot() {
    let pool = host_pool(8, 16);
    let a = KvCache::new(&pool, 5).unwrap();
    let b = KvCache::new(&pool, 17).unwrap();
    let c = KvCache::new(&pool, 0).unwrap();

    let batch = BatchedKvCache::new([&a, &b, &c]).unwrap();
    assert_eq!(batch.batch_size(), 3);
    assert_eq!(
        (0..3).map(|i| batch.length_at(i)).collect::<Vec<_>>(),
        vec![5, 17, 0]
    );
    assert_eq!(
        (0..3).map(|i| batch.blocks_at(i).len()).collect::<Vec<_>>(),
        vec![1, 2, 0]
    );
    assert_eq!(batch.last_page_len(), &[5, 1, 0]);
}

#[test]
fn test_order_follows_input() {
    let pool = host_pool(8, 16);
    let a = KvCache::new(&pool, 3).unwrap();
    let b = KvCache::new(&pool, 40).unwrap();

    let forward = BatchedKvCache::new([&a, &b]).unwrap();
    let reverse = BatchedKvCache::new([&b, &a]).unwrap();
    assert_eq!(forward.length_at(0), reverse.length_at(1));
    assert_eq!(forward.blocks_at(1), reverse.blocks_at(0));
}

#[test]
fn test_blocks_match_cache_order() {
    let pool = host_pool(8, 4);
    let mut a = KvCache::new(&pool, 2).unwrap();
    let b = KvCache::new(&pool, 4).unwrap();
    for _ in 0..6 {
        a.append_token().unwrap();
    }

    let batch = BatchedKvCache::new([&a, &b]).unwrap();
    let expected: Vec<u32> = a.blocks().iter().map(|b| b.get()).collect();
    assert_eq!(batch.blocks_at(0), expected.as_slice());
    for position in 0..a.len() {
        assert_eq!(batch.locate(0, position), a.slot_of(position));
    }
}

#[test]
fn test_batch_does_not_touch_pool() {
    let pool = host_pool(8, 16);
    let a = KvCache::new(&pool, 30).unwrap();
    let before = pool.stats();
    {
        let _batch = BatchedKvCache::new([&a, &a]).unwrap();
    }
    assert_eq!(pool.stats(), before);
}

#[test]
fn test_rebuild_after_growth() {
    let pool = host_pool(8, 16);
    let mut a = KvCache::new(&pool, 16).unwrap();
    let first = BatchedKvCache::new([&a]).unwrap();
    assert_eq!(first.blocks_at(0).len(), 1);
    drop(first);

    a.append_token().unwrap();
    let second = BatchedKvCache::new([&a]).unwrap();
    assert_eq!(second.length_at(0), 17);
    assert_eq!(second.blocks_at(0).len(), 2);
}

#[test]
fn test_mixed_pools_rejected() {
    init_test_env();
    let small = KvPool::on_host(config(4, 16)).unwrap();
    let large = KvPool::on_host(config(4, 32)).unwrap();
    let a = KvCache::new(&small, 3).unwrap();
    let b = KvCache::new(&large, 3).unwrap();

    let err = BatchedKvCache::new([&a, &b]).unwrap_err();
    assert!(err.is_precondition_violation());
    assert!(err.to_string().contains("block_len 16 vs 32"));
}

#[test]
fn test_same_geometry_different_pool_rejected() {
    let first = host_pool(4, 16);
    let second = host_pool(4, 16);
    let a = KvCache::new(&first, 3).unwrap();
    let b = KvCache::new(&second, 3).unwrap();

    let err = BatchedKvCache::new([&a, &b]).unwrap_err();
    assert!(err.is_precondition_violation());
}
