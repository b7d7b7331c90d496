use std::sync::Arc;

use test_case::test_case;

use crate::Matrix;
use crate::stream::HostStreamFactory;
use crate::stream_registry::StreamRegistry;
use crate::test::host_allocator;

#[test]
fn test_new_shape() {
    let (_, allocator) = host_allocator();
    let m = Matrix::<f32>::new(&allocator, 3, 5);

    assert_eq!((m.rows(), m.cols(), m.size()), (3, 5, 15));
    assert_eq!(m.vec().len(), 15);
    assert_eq!(m.at(2, 4), 0.0);
}

#[test]
fn test_row_major_layout() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<i32>::new(&allocator, 3, 4);

    m.set(1, 2, 42);
    assert_eq!(m.at(1, 2), 42);
    assert_eq!(m.vec().get(1 * 4 + 2), 42);
    assert_eq!(m.row(1), Some(&[0, 0, 42, 0][..]));
}

#[test]
fn test_from_rows() {
    let (_, allocator) = host_allocator();
    let m = Matrix::from_rows(&allocator, &[[1u8, 2, 3], [4, 5, 6]]);

    assert_eq!((m.rows(), m.cols()), (2, 3));
    assert_eq!(m.at(1, 0), 4);
    assert_eq!(m.vec().to_vec(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
#[should_panic(expected = "row 1 has 1 elements")]
fn test_from_rows_ragged() {
    let (_, allocator) = host_allocator();
    let _ = Matrix::<f32>::from_rows(&allocator, &[vec![1.0, 2.0], vec![3.0]]);
}

#[test]
fn test_debug_filled() {
    let (_, allocator) = host_allocator();
    let m = Matrix::<f32>::filled(&allocator, 3, 4, 2.0);
    assert_eq!(m.debug(), "3x4:8 8 8 ");
    assert_eq!(m.to_string(), m.debug());
}

#[test_case(0, 0, "0x0:" ; "empty")]
#[test_case(2, 0, "2x0:0 0 " ; "zero columns")]
#[test_case(0, 3, "0x3:" ; "zero rows")]
fn test_debug_degenerate(rows: usize, cols: usize, expected: &str) {
    let (_, allocator) = host_allocator();
    assert_eq!(Matrix::<f64>::new(&allocator, rows, cols).debug(), expected);
}

#[test]
fn test_debug_fractional_and_signed() {
    let (_, allocator) = host_allocator();
    assert_eq!(Matrix::<f64>::filled(&allocator, 1, 3, 1.0 / 9.0).debug(), "1x3:0.333333 ");
    assert_eq!(Matrix::<i8>::filled(&allocator, 2, 2, -3).debug(), "2x2:-6 -6 ");
    assert_eq!(Matrix::<f32>::filled(&allocator, 1, 2, 7.5e6).debug(), "1x2:1.5e+07 ");
}

#[test_case(&[1.0e8, 1.0, -1.0e8], "1x3:0 " ; "small term absorbed")]
#[test_case(&[16_777_216.0, 1.0, 1.0], "1x3:1.67772e+07 " ; "past the mantissa")]
#[test_case(&[0.1, 0.2, 0.3], "1x3:0.6 " ; "ordinary fractions")]
fn test_debug_accumulates_in_single_precision(row: &[f32], expected: &str) {
    let (_, allocator) = host_allocator();
    assert_eq!(Matrix::from_rows(&allocator, &[row]).debug(), expected);
}

#[test]
fn test_debug_narrows_double_rows() {
    let (_, allocator) = host_allocator();
    let m = Matrix::from_rows(&allocator, &[[1.0e8f64, 1.0, -1.0e8]]);
    assert_eq!(m.debug(), "1x3:0 ");
}

#[test]
fn test_resize_within_capacity_keeps_storage() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 4, 4);
    let addr = m.vec().addr();

    m.resize(2, 8);
    assert_eq!((m.rows(), m.cols()), (2, 8));
    assert_eq!(m.vec().addr(), addr);

    m.resize(3, 3);
    assert_eq!(m.size(), 9);
    assert_eq!(m.vec().len(), 9);
    assert_eq!(m.vec().addr(), addr);
}

#[test]
fn test_resize_with_value() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<u32>::new(&allocator, 1, 1);
    m.resize_with(2, 3, 9);

    assert_eq!(m.vec().to_vec(), vec![9; 6]);
    assert_eq!(m.debug(), "2x3:27 27 ");
}

#[test]
fn test_reserve_then_reshape_does_not_reallocate() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 0, 0);
    m.reserve(4, 10);
    let addr = m.vec().addr();
    assert!(addr.is_some());
    assert_eq!((m.rows(), m.cols()), (0, 0));

    for step in 1..=10 {
        m.reshape(4, step);
        m.set(3, step - 1, step as f32);
        assert_eq!(m.vec().addr(), addr);
    }
    assert_eq!(m.at(3, 9), 10.0);
}

#[test]
fn test_reshape_reinterprets_storage() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::from_rows(&allocator, &[[1i64, 2, 3], [4, 5, 6]]);
    m.reshape(3, 2);

    assert_eq!(m.at(1, 0), 3);
    assert_eq!(m.at(2, 1), 6);
}

#[cfg(any(debug_assertions, feature = "checked-indexing"))]
#[test]
#[should_panic(expected = "cannot reshape")]
fn test_reshape_past_capacity() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 2, 2);
    m.reshape(3, 2);
}

#[cfg(any(debug_assertions, feature = "checked-indexing"))]
#[test]
#[should_panic(expected = "out of range")]
fn test_column_out_of_range() {
    let (_, allocator) = host_allocator();
    let m = Matrix::<f32>::new(&allocator, 2, 2);
    // Offset 2 is inside the allocation; only the index contract catches it.
    m.at(0, 2);
}

#[test]
fn test_clear_keeps_capacity() {
    let (host, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 4, 4);
    let addr = m.vec().addr();

    m.clear();
    assert_eq!((m.rows(), m.cols(), m.size()), (0, 0, 0));
    assert_eq!(m.vec().capacity(), 16);
    assert_eq!(host.in_use(), 64);

    m.resize(2, 2);
    assert_eq!(m.vec().addr(), addr);
}

#[test]
fn test_purge_releases_memory() {
    let (host, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 4, 4);

    m.purge();
    assert_eq!((m.rows(), m.cols()), (0, 0));
    assert!(!m.vec().is_allocated());
    assert_eq!(host.in_use(), 0);

    m.resize(1, 2);
    assert_eq!(m.vec().to_vec(), vec![0.0, 0.0]);
}

#[test]
fn test_take_empties_source() {
    let (host, allocator) = host_allocator();
    let mut source = Matrix::<f64>::filled(&allocator, 2, 3, 1.0);
    let addr = source.vec().addr();

    let moved = source.take();
    assert_eq!((moved.rows(), moved.cols()), (2, 3));
    assert_eq!(moved.vec().addr(), addr);
    assert_eq!(moved.debug(), "2x3:3 3 ");

    assert_eq!((source.rows(), source.cols()), (0, 0));
    assert!(!source.vec().is_allocated());
    assert_eq!(host.in_use(), 48);
}

#[test]
fn test_duplicate_is_independent() {
    let (_, allocator) = host_allocator();
    let original = Matrix::<i32>::filled(&allocator, 2, 2, 5);
    let mut copy = original.duplicate();

    copy.set(0, 0, 0);
    assert_eq!(original.at(0, 0), 5);
    assert_eq!(copy.debug(), "2x2:5 10 ");
}

#[test]
fn test_vec_mut_writes_are_visible() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 2, 2);
    m.vec_mut().fill(0.5);
    assert_eq!(m.debug(), "2x2:1 1 ");
}

#[test]
fn test_copy_to_host_through_registry() {
    let (_, allocator) = host_allocator();
    let streams = StreamRegistry::new(Arc::new(HostStreamFactory));
    let mut m = Matrix::<f32>::new(&allocator, 0, 0);
    m.reserve(2, 4);
    m.reshape(2, 3);
    m.set(1, 2, 6.0);

    assert_eq!(m.copy_to_host(&streams), vec![0.0, 0.0, 0.0, 0.0, 0.0, 6.0]);
    assert_eq!(streams.len(), 1);
}

#[test]
fn test_row_reaches_reserved_storage() {
    let (_, allocator) = host_allocator();
    let mut m = Matrix::<f32>::new(&allocator, 0, 0);
    m.reserve(2, 4);
    m.reshape(2, 3);
    m.set(1, 2, 6.0);

    assert_eq!(m.vec().len(), 0);
    assert_eq!(m.row(0), Some(&[0.0, 0.0, 0.0][..]));
    assert_eq!(m.row(1), Some(&[0.0, 0.0, 6.0][..]));
}
