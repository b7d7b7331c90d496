use std::sync::Arc;

use crate::allocator::{Allocator, BufferOptions, HostAllocator, PoolAllocator, PoolStats};
use crate::DeviceBuffer;

fn pool(max_buffers: usize) -> (Arc<HostAllocator>, Arc<PoolAllocator>) {
    let host = Arc::new(HostAllocator::new());
    let pool = Arc::new(PoolAllocator::with_capacity(host.clone(), max_buffers));
    (host, pool)
}

#[test]
fn test_freed_buffer_is_reused() {
    let (_, pool) = pool(4);

    let first = pool.alloc(256, &BufferOptions::ZEROED).unwrap();
    let addr = first.addr();
    pool.free(first);
    assert_eq!(pool.stats(), PoolStats { hits: 0, misses: 1, cached: 1 });

    let second = pool.alloc(256, &BufferOptions::ZEROED).unwrap();
    assert_eq!(second.addr(), addr);
    assert_eq!(pool.stats(), PoolStats { hits: 1, misses: 1, cached: 0 });
    pool.free(second);
}

#[test]
fn test_sizes_do_not_mix() {
    let (_, pool) = pool(4);

    let small = pool.alloc(64, &BufferOptions::ZEROED).unwrap();
    pool.free(small);
    let large = pool.alloc(128, &BufferOptions::ZEROED).unwrap();

    assert_eq!(pool.stats().misses, 2);
    assert_eq!(large.size(), 128);
    pool.free(large);
}

#[test]
fn test_zeroed_hit_is_cleared() {
    let (_, pool) = pool(4);

    let mut raw = pool.alloc(16, &BufferOptions::ZEROED).unwrap();
    raw.write(0, &[0xAB; 16]).unwrap();
    pool.free(raw);

    let raw = pool.alloc(16, &BufferOptions::ZEROED).unwrap();
    assert_eq!(raw.host(), Some(&[0u8; 16][..]));
    pool.free(raw);
}

#[test]
fn test_cache_is_bounded_per_size() {
    let (host, pool) = pool(1);

    let a = pool.alloc(32, &BufferOptions::ZEROED).unwrap();
    let b = pool.alloc(32, &BufferOptions::ZEROED).unwrap();
    pool.free(a);
    pool.free(b);

    assert_eq!(pool.stats().cached, 1);
    assert_eq!(host.in_use(), 32);
}

#[test]
fn test_failure_trims_and_retries() {
    let host = Arc::new(HostAllocator::with_limit(96));
    let pool = PoolAllocator::with_capacity(host.clone(), 4);

    let parked = pool.alloc(64, &BufferOptions::ZEROED).unwrap();
    pool.free(parked);
    assert_eq!(host.in_use(), 64);

    // 64 parked + 48 new exceeds the limit until the cache is dropped.
    let raw = pool.alloc(48, &BufferOptions::ZEROED).unwrap();
    assert_eq!(pool.stats().cached, 0);
    assert_eq!(host.in_use(), 48);
    pool.free(raw);
}

#[test]
fn test_trim_and_drop_return_memory() {
    let (host, pool) = pool(8);
    let allocator: Arc<dyn Allocator> = pool.clone();

    {
        let _a = DeviceBuffer::<f32>::with_len(&allocator, 10);
        let _b = DeviceBuffer::<f32>::with_len(&allocator, 20);
    }
    assert_eq!(pool.stats().cached, 2);
    assert_eq!(host.in_use(), 120);

    pool.trim();
    assert_eq!(host.in_use(), 0);

    let c = DeviceBuffer::<f32>::with_len(&allocator, 10);
    drop(allocator);
    drop(c);
    drop(pool);
    assert_eq!(host.in_use(), 0);
}

#[test]
fn test_pool_name_and_device() {
    let (_, pool) = pool(1);
    assert_eq!(pool.name(), "CPU+pool");
    assert_eq!(pool.device(), nmt_dtype::DeviceSpec::Cpu);
}
