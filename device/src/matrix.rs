//! Two-dimensional row-major view over a [`DeviceBuffer`].
//!
//! Logical element `(i, j)` lives at physical offset `i * cols + j`. The
//! layout never changes; only the shape and the backing extent do.
//!
//! # Resize, reshape and reserve
//!
//! - [`Matrix::resize`] sets the shape and makes the buffer hold exactly
//!   `rows * cols` elements, reallocating if needed.
//! - [`Matrix::reshape`] only reinterprets the current storage. The new
//!   element count must fit the buffer's capacity; nothing moves.
//! - [`Matrix::reserve`] grows capacity ahead of time so that later
//!   reshapes and bounded resizes do not reallocate.
//!
//! A decoder that widens its score table one step at a time reserves the
//! final extent once and reshapes in place:
//!
//! ```ignore
//! let mut scores = Matrix::<f32>::new(&allocator, 0, 0);
//! scores.reserve(beam_size, max_len);
//! for step in 1..=max_len {
//!     scores.reshape(beam_size, step);
//!     // ... populate column `step - 1` ...
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use nmt_dtype::Element;

use crate::allocator::Allocator;
use crate::buffer::DeviceBuffer;
use crate::stream_registry::StreamRegistry;

/// Index contract check. Active in debug builds, or always with the
/// `checked-indexing` feature.
macro_rules! contract {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(any(debug_assertions, feature = "checked-indexing")) {
            assert!($cond, $($arg)+);
        }
    };
}

/// A `rows × cols` matrix stored row-major in device memory.
///
/// Move-only: transfer with Rust moves or [`Matrix::take`]; copy with
/// [`Matrix::duplicate`].
pub struct Matrix<T: Element> {
    rows: usize,
    cols: usize,
    data: DeviceBuffer<T>,
}

impl<T: Element> Matrix<T> {
    /// A 0×0 matrix with no backing memory.
    pub fn empty(allocator: &Arc<dyn Allocator>) -> Self {
        Self { rows: 0, cols: 0, data: DeviceBuffer::new(allocator) }
    }

    /// A `rows × cols` matrix of default elements.
    #[track_caller]
    pub fn new(allocator: &Arc<dyn Allocator>, rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: DeviceBuffer::with_len(allocator, rows * cols) }
    }

    /// A `rows × cols` matrix with every element set to `value`.
    #[track_caller]
    pub fn filled(allocator: &Arc<dyn Allocator>, rows: usize, cols: usize, value: T) -> Self {
        Self { rows, cols, data: DeviceBuffer::filled(allocator, rows * cols, value) }
    }

    /// Upload host rows. All rows must have the same length.
    #[track_caller]
    pub fn from_rows<R: AsRef<[T]>>(allocator: &Arc<dyn Allocator>, rows: &[R]) -> Self {
        let cols = rows.first().map_or(0, |row| row.as_ref().len());
        let mut values = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            assert_eq!(row.len(), cols, "row {i} has {} elements, expected {cols}", row.len());
            values.extend_from_slice(row);
        }
        Self { rows: rows.len(), cols, data: DeviceBuffer::from_slice(allocator, &values) }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Logical element count, `rows * cols`.
    pub fn size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Read `(i, j)`.
    ///
    /// Requires `i < rows` and `j < cols`. Debug builds assert it; release
    /// builds only keep the offset inside the allocation.
    #[inline]
    #[track_caller]
    pub fn at(&self, i: usize, j: usize) -> T {
        contract!(i < self.rows && j < self.cols, "({i}, {j}) out of range for {}x{} matrix", self.rows, self.cols);
        self.data.get(i * self.cols + j)
    }

    /// Write `(i, j)`. Same contract as [`Matrix::at`].
    #[inline]
    #[track_caller]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        contract!(i < self.rows && j < self.cols, "({i}, {j}) out of range for {}x{} matrix", self.rows, self.cols);
        self.data.set(i * self.cols + j, value)
    }

    /// Host view of row `i`, on backends with host-visible memory.
    ///
    /// Works on reshaped matrices whose rows reach past the buffer's `len`
    /// into reserved storage.
    pub fn row(&self, i: usize) -> Option<&[T]> {
        contract!(i < self.rows, "row {i} out of range for {}x{} matrix", self.rows, self.cols);
        let start = i * self.cols;
        self.data.storage().map(|values| &values[start..start + self.cols])
    }

    /// Set the shape and make the buffer hold exactly `rows * cols` elements.
    #[track_caller]
    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.data.resize(rows * cols);
    }

    /// As [`Matrix::resize`], with every element set to `value`.
    #[track_caller]
    pub fn resize_with(&mut self, rows: usize, cols: usize, value: T) {
        self.rows = rows;
        self.cols = cols;
        self.data.resize_with(rows * cols, value);
    }

    /// Change only the logical shape. `rows * cols` must not exceed the
    /// buffer's capacity; storage is neither moved nor reallocated.
    #[track_caller]
    pub fn reshape(&mut self, rows: usize, cols: usize) {
        contract!(
            rows * cols <= self.data.capacity(),
            "cannot reshape to {rows}x{cols}: capacity is {} elements",
            self.data.capacity()
        );
        self.rows = rows;
        self.cols = cols;
    }

    /// Grow backing capacity to `rows * cols` elements without changing the shape.
    #[track_caller]
    pub fn reserve(&mut self, rows: usize, cols: usize) {
        self.data.reserve(rows * cols);
    }

    /// Reset to 0×0. The allocation is kept, so a following resize within
    /// the old capacity does not reallocate.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rows = 0;
        self.cols = 0;
    }

    /// Reset to 0×0 and return the allocation to the allocator now.
    pub fn purge(&mut self) {
        self.clear();
        let empty = DeviceBuffer::new(self.data.allocator());
        drop(std::mem::replace(&mut self.data, empty));
    }

    /// Transfer ownership of shape and storage, leaving `self` 0×0 with an
    /// empty buffer.
    pub fn take(&mut self) -> Self {
        let empty = Self::empty(self.data.allocator());
        std::mem::replace(self, empty)
    }

    /// Explicit deep copy.
    #[track_caller]
    pub fn duplicate(&self) -> Self {
        Self { rows: self.rows, cols: self.cols, data: self.data.duplicate() }
    }

    /// The backing buffer, for kernels that work on contiguous storage.
    pub fn vec(&self) -> &DeviceBuffer<T> {
        &self.data
    }

    pub fn vec_mut(&mut self) -> &mut DeviceBuffer<T> {
        &mut self.data
    }

    /// Read back the logical elements once the calling thread's stream for
    /// `T` has drained.
    #[track_caller]
    pub fn copy_to_host(&self, streams: &StreamRegistry) -> Vec<T> {
        let stream = streams.get_stream::<T>();
        stream.synchronize();
        if self.size() <= self.data.len() {
            let mut values = self.data.to_vec();
            values.truncate(self.size());
            values
        } else {
            // Reshaped past `len` into reserved storage.
            (0..self.size()).map(|offset| self.data.get(offset)).collect()
        }
    }

    /// Diagnostic summary: `"{rows}x{cols}:"` followed by each row's sum and
    /// a space.
    ///
    /// Row sums accumulate in single precision, so large values absorb small
    /// ones exactly as a `float` accumulator would.
    ///
    /// `Matrix::filled(&a, 3, 4, 2.0).debug() == "3x4:8 8 8 "`.
    pub fn debug(&self) -> String {
        let mut out = format!("{}x{}:", self.rows, self.cols);
        for i in 0..self.rows {
            let sum = (0..self.cols).fold(0.0f32, |sum, j| (f64::from(sum) + self.at(i, j).to_f64()) as f32);
            out.push_str(&format!("{} ", format_general(f64::from(sum))));
        }
        out
    }
}

impl<T: Element> fmt::Display for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug())
    }
}

impl<T: Element> fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix").field("rows", &self.rows).field("cols", &self.cols).field("data", &self.data).finish()
    }
}

/// Format like C's `%g`: six significant digits, trailing zeros dropped,
/// scientific notation for exponents below -4 or from 6 upward.
pub(crate) fn format_general(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to the target precision first; rounding may bump the exponent (999999.5 -> 1e+06).
    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') { digits.trim_end_matches('0').trim_end_matches('.') } else { digits }
}
