use crate::DeviceBuffer;
use crate::stream::Stream;
use crate::test::host_allocator;
use nmt_dtype::ScalarDType;

#[test]
fn test_new_buffer_is_unallocated() {
    let (_, allocator) = host_allocator();
    let buffer = DeviceBuffer::<f32>::new(&allocator);

    assert!(!buffer.is_allocated());
    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), 0);
    assert_eq!(buffer.addr(), None);
}

#[test]
fn test_with_len_reads_default() {
    let (host, allocator) = host_allocator();
    let buffer = DeviceBuffer::<i32>::with_len(&allocator, 10);

    assert!(buffer.is_allocated());
    assert_eq!(buffer.len(), 10);
    assert_eq!(buffer.capacity(), 10);
    assert_eq!(buffer.to_vec(), vec![0; 10]);
    assert_eq!(host.in_use(), 40);
}

#[test]
fn test_allocate_zero_holds_no_memory() {
    let (host, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::<f64>::with_len(&allocator, 4);
    buffer.allocate(0);

    assert!(!buffer.is_allocated());
    assert_eq!(host.in_use(), 0);
}

#[test]
fn test_resize_grow_preserves_prefix() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::from_slice(&allocator, &[1u16, 2, 3]);
    buffer.resize(6);

    assert_eq!(buffer.to_vec(), vec![1, 2, 3, 0, 0, 0]);
    assert_eq!(buffer.capacity(), 6);
}

#[test]
fn test_resize_shrink_keeps_allocation() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::from_slice(&allocator, &[1.0f32, 2.0, 3.0, 4.0]);
    let addr = buffer.addr();

    buffer.resize(2);
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.capacity(), 4);
    assert_eq!(buffer.addr(), addr);

    // Regrowing within capacity must not resurrect the old tail.
    buffer.resize(4);
    assert_eq!(buffer.addr(), addr);
    assert_eq!(buffer.to_vec(), vec![1.0, 2.0, 0.0, 0.0]);
}

#[test]
fn test_resize_with_fills_everything() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::from_slice(&allocator, &[1i64, 2]);

    buffer.resize_with(5, 7);
    assert_eq!(buffer.to_vec(), vec![7; 5]);

    buffer.resize_with(3, -1);
    assert_eq!(buffer.to_vec(), vec![-1; 3]);
    assert_eq!(buffer.capacity(), 5);
}

#[test]
fn test_reserve_keeps_len_and_contents() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::from_slice(&allocator, &[9u8, 8, 7]);

    buffer.reserve(16);
    assert_eq!(buffer.len(), 3);
    assert_eq!(buffer.capacity(), 16);
    assert_eq!(buffer.to_vec(), vec![9, 8, 7]);

    let addr = buffer.addr();
    buffer.reserve(8);
    assert_eq!(buffer.capacity(), 16, "reserve never shrinks");
    assert_eq!(buffer.addr(), addr);
}

#[test]
fn test_clear_keeps_capacity_release_frees() {
    let (host, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::<f32>::with_len(&allocator, 8);

    buffer.clear();
    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), 8);
    assert_eq!(host.in_use(), 32);

    buffer.release();
    assert!(!buffer.is_allocated());
    assert_eq!(buffer.capacity(), 0);
    assert_eq!(host.in_use(), 0);
}

#[test]
fn test_drop_returns_memory() {
    let (host, allocator) = host_allocator();
    {
        let _a = DeviceBuffer::<f64>::with_len(&allocator, 16);
        let _b = DeviceBuffer::<u32>::with_len(&allocator, 16);
        assert_eq!(host.in_use(), 16 * 8 + 16 * 4);
    }
    assert_eq!(host.in_use(), 0);
}

#[test]
fn test_get_set_fill() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::<i16>::with_len(&allocator, 4);

    buffer.set(2, -5);
    assert_eq!(buffer.get(2), -5);
    assert_eq!(buffer.as_slice(), Some(&[0, 0, -5, 0][..]));

    buffer.fill(3);
    assert_eq!(buffer.to_vec(), vec![3; 4]);

    if let Some(values) = buffer.as_mut_slice() {
        values[0] = 1;
    }
    assert_eq!(buffer.get(0), 1);
}

#[test]
#[should_panic]
fn test_get_past_capacity_panics() {
    let (_, allocator) = host_allocator();
    let buffer = DeviceBuffer::<f32>::with_len(&allocator, 4);
    buffer.get(4);
}

#[test]
fn test_duplicate_is_independent() {
    let (host, allocator) = host_allocator();
    let original = DeviceBuffer::from_slice(&allocator, &[1.5f64, 2.5]);
    let mut copy = original.duplicate();

    assert_ne!(copy.addr(), original.addr());
    copy.set(0, 0.0);
    assert_eq!(original.to_vec(), vec![1.5, 2.5]);
    assert_eq!(copy.to_vec(), vec![0.0, 2.5]);
    assert_eq!(host.in_use(), 32);
}

#[test]
fn test_duplicate_of_empty() {
    let (_, allocator) = host_allocator();
    let copy = DeviceBuffer::<u64>::new(&allocator).duplicate();
    assert!(!copy.is_allocated());
}

#[test]
fn test_copy_from_slice_reuses_capacity() {
    let (_, allocator) = host_allocator();
    let mut buffer = DeviceBuffer::<u32>::with_len(&allocator, 8);
    let addr = buffer.addr();

    buffer.copy_from_slice(&[4, 5, 6]);
    assert_eq!(buffer.addr(), addr);
    assert_eq!(buffer.to_vec(), vec![4, 5, 6]);
}

#[test]
fn test_stream_ordered_copies() {
    let (_, allocator) = host_allocator();
    let stream = Stream::host(ScalarDType::Float32).unwrap();
    let mut buffer = DeviceBuffer::<f32>::new(&allocator);

    buffer.copy_from_host(&stream, &[1.0, 2.0, 3.0]);
    assert_eq!(buffer.copy_to_host(&stream), vec![1.0, 2.0, 3.0]);
}
