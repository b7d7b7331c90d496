use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use nmt_dtype::Element;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{Result, SizeMismatchSnafu};
use crate::fatal;
use crate::stream::Stream;

/// View a slice of elements as bytes.
fn bytes_of<T: Element>(values: &[T]) -> &[u8] {
    // SAFETY: Element types are plain numeric primitives without padding.
    unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values)) }
}

fn bytes_of_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    // SAFETY: as above; every byte pattern is a valid Element.
    unsafe { std::slice::from_raw_parts_mut(values.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(values)) }
}

/// A contiguous block of device memory holding elements of type `T`.
///
/// The buffer tracks two counts: `len`, the number of addressable elements,
/// and `capacity`, the number of elements physically backed by the current
/// allocation. A buffer with capacity 0 holds no allocation. Every element in
/// `0..capacity` is initialised: fresh storage reads as `T::default()`.
///
/// Ownership is exclusive and the type is not `Clone`; an independent copy
/// is only made through [`DeviceBuffer::duplicate`]. Allocation failures in
/// the public operations are unrecoverable (see [`crate::fatal`]). Any call
/// that reallocates invalidates slices and addresses obtained before it.
pub struct DeviceBuffer<T: Element> {
    raw: Option<RawBuffer>,
    allocator: Arc<dyn Allocator>,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> DeviceBuffer<T> {
    /// Create an empty buffer that will allocate from `allocator`.
    pub fn new(allocator: &Arc<dyn Allocator>) -> Self {
        Self { raw: None, allocator: Arc::clone(allocator), len: 0, capacity: 0, _marker: PhantomData }
    }

    /// Create a buffer of `len` default elements.
    #[track_caller]
    pub fn with_len(allocator: &Arc<dyn Allocator>, len: usize) -> Self {
        let mut buffer = Self::new(allocator);
        buffer.allocate(len);
        buffer
    }

    /// Create a buffer of `len` copies of `value`.
    #[track_caller]
    pub fn filled(allocator: &Arc<dyn Allocator>, len: usize, value: T) -> Self {
        let mut buffer = Self::new(allocator);
        buffer.resize_with(len, value);
        buffer
    }

    /// Upload `values` into a new buffer.
    #[track_caller]
    pub fn from_slice(allocator: &Arc<dyn Allocator>, values: &[T]) -> Self {
        let mut buffer = Self::new(allocator);
        buffer.copy_from_slice(values);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements backed by the current allocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_allocated(&self) -> bool {
        self.raw.is_some()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Address of the backing allocation, if any. Stable until the next
    /// reallocation; used to observe storage identity.
    pub fn addr(&self) -> Option<usize> {
        self.raw.as_ref().map(RawBuffer::addr)
    }

    /// Replace the allocation with fresh storage for `len` default elements.
    #[track_caller]
    pub fn allocate(&mut self, len: usize) {
        fatal::or_abort(self.try_allocate(len))
    }

    pub fn try_allocate(&mut self, len: usize) -> Result<()> {
        self.release();
        self.raw = self.alloc_raw(len, &BufferOptions::ZEROED)?;
        self.len = len;
        self.capacity = len;
        Ok(())
    }

    /// Set the element count to `len`.
    ///
    /// Shrinking keeps the allocation. Growing within capacity initialises
    /// the new tail to `T::default()`; growing past it reallocates, keeping
    /// the first `len` elements.
    #[track_caller]
    pub fn resize(&mut self, len: usize) {
        fatal::or_abort(self.try_resize(len))
    }

    pub fn try_resize(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            self.grow(len)?;
        } else if len > self.len {
            self.write_repeated(self.len, len - self.len, T::default())?;
        }
        self.len = len;
        Ok(())
    }

    /// Set the element count to `len` and every element to `value`.
    ///
    /// Previous contents are not preserved, so growth reallocates without
    /// copying.
    #[track_caller]
    pub fn resize_with(&mut self, len: usize, value: T) {
        fatal::or_abort(self.try_resize_with(len, value))
    }

    pub fn try_resize_with(&mut self, len: usize, value: T) -> Result<()> {
        if len > self.capacity {
            let options = if value == T::default() { BufferOptions::ZEROED } else { BufferOptions::UNINIT };
            self.release();
            self.raw = self.alloc_raw(len, &options)?;
            self.capacity = len;
            tracing::debug!(len, dtype = %T::DTYPE, "device buffer reallocated for fill");
            if value == T::default() {
                self.len = len;
                return Ok(());
            }
        }
        self.write_repeated(0, len, value)?;
        self.len = len;
        Ok(())
    }

    /// Ensure capacity for at least `capacity` elements without changing `len`.
    #[track_caller]
    pub fn reserve(&mut self, capacity: usize) {
        fatal::or_abort(self.try_reserve(capacity))
    }

    pub fn try_reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity > self.capacity {
            self.grow(capacity)?;
        }
        Ok(())
    }

    /// Drop all elements, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Return the allocation to the allocator and reset to empty.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            tracing::debug!(capacity = self.capacity, dtype = %T::DTYPE, "device buffer released");
            self.allocator.free(raw);
        }
        self.len = 0;
        self.capacity = 0;
    }

    /// Read element `index`.
    ///
    /// `index` must be below [`capacity`](Self::capacity); callers working in
    /// logical coordinates keep it below `len`.
    #[inline]
    #[track_caller]
    pub fn get(&self, index: usize) -> T {
        if let Some(values) = self.host_elements() {
            return values[index];
        }
        self.check_index(index);
        let mut value = [T::default()];
        fatal::or_abort(self.read_into(index, &mut value));
        value[0]
    }

    /// Write element `index`. Same contract as [`get`](Self::get).
    #[inline]
    #[track_caller]
    pub fn set(&mut self, index: usize, value: T) {
        if let Some(values) = self.host_elements_mut() {
            values[index] = value;
            return;
        }
        self.check_index(index);
        fatal::or_abort(self.write_from(index, &[value]))
    }

    #[track_caller]
    fn check_index(&self, index: usize) {
        assert!(index < self.capacity, "index {index} out of range for device buffer of capacity {}", self.capacity);
    }

    /// Set every element in `0..len` to `value`.
    #[track_caller]
    pub fn fill(&mut self, value: T) {
        fatal::or_abort(self.write_repeated(0, self.len, value))
    }

    /// Host-visible view of the `len` elements, when the backend allows it.
    pub fn as_slice(&self) -> Option<&[T]> {
        self.host_elements().map(|values| &values[..self.len])
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        let len = self.len;
        self.host_elements_mut().map(|values| &mut values[..len])
    }

    /// Host-visible view of the whole allocation, `capacity` elements wide.
    ///
    /// Reaches reserved storage past `len`, which reshaped matrices address.
    pub(crate) fn storage(&self) -> Option<&[T]> {
        self.host_elements()
    }

    /// Copy the `len` elements back to host memory.
    #[track_caller]
    pub fn to_vec(&self) -> Vec<T> {
        if let Some(values) = self.as_slice() {
            return values.to_vec();
        }
        let mut values = vec![T::default(); self.len];
        fatal::or_abort(self.read_into(0, &mut values));
        values
    }

    /// Replace the contents with `values`, resizing to `values.len()`.
    #[track_caller]
    pub fn copy_from_slice(&mut self, values: &[T]) {
        fatal::or_abort(self.try_copy_from_slice(values))
    }

    pub fn try_copy_from_slice(&mut self, values: &[T]) -> Result<()> {
        if values.len() > self.capacity {
            self.release();
            self.raw = self.alloc_raw(values.len(), &BufferOptions::UNINIT)?;
            self.capacity = values.len();
        }
        self.len = values.len();
        self.write_from(0, values)
    }

    /// Read back after all work issued to `stream` has completed.
    #[track_caller]
    pub fn copy_to_host(&self, stream: &Stream) -> Vec<T> {
        stream.synchronize();
        self.to_vec()
    }

    /// Upload once all work issued to `stream` has completed.
    #[track_caller]
    pub fn copy_from_host(&mut self, stream: &Stream, values: &[T]) {
        stream.synchronize();
        self.copy_from_slice(values);
    }

    /// Explicit deep copy into a new allocation from the same allocator.
    #[track_caller]
    pub fn duplicate(&self) -> Self {
        fatal::or_abort(self.try_duplicate())
    }

    pub fn try_duplicate(&self) -> Result<Self> {
        let mut copy = Self::new(&self.allocator);
        copy.raw = copy.alloc_raw(self.len, &BufferOptions::ZEROED)?;
        copy.capacity = self.len;
        copy.len = self.len;
        if let (Some(dst), Some(src)) = (copy.raw.as_mut(), self.raw.as_ref()) {
            dst.copy_prefix_from(src, self.len * size_of::<T>())?;
        }
        Ok(copy)
    }

    fn alloc_raw(&self, len: usize, options: &BufferOptions) -> Result<Option<RawBuffer>> {
        if len == 0 {
            return Ok(None);
        }
        let size = len.checked_mul(size_of::<T>()).ok_or_else(|| {
            crate::error::AllocationFailedSnafu {
                allocator: self.allocator.name(),
                size: usize::MAX,
                reason: format!("{len} elements of {} overflow the address space", T::DTYPE),
            }
            .build()
        })?;
        let raw = self.allocator.alloc(size, options)?;
        tracing::debug!(len, size, dtype = %T::DTYPE, allocator = self.allocator.name(), "device buffer allocated");
        Ok(Some(raw))
    }

    /// Move to a larger zeroed allocation, keeping the first `len` elements.
    fn grow(&mut self, capacity: usize) -> Result<()> {
        let mut raw = self.alloc_raw(capacity, &BufferOptions::ZEROED)?;
        if let (Some(dst), Some(src)) = (raw.as_mut(), self.raw.as_ref()) {
            dst.copy_prefix_from(src, self.len * size_of::<T>())?;
        }
        if let Some(old) = std::mem::replace(&mut self.raw, raw) {
            self.allocator.free(old);
        }
        tracing::debug!(from = self.capacity, to = capacity, len = self.len, dtype = %T::DTYPE, "device buffer grown");
        self.capacity = capacity;
        Ok(())
    }

    fn host_elements(&self) -> Option<&[T]> {
        let bytes = self.raw.as_ref()?.host()?;
        // SAFETY: host allocations are 64-byte aligned and fully initialised,
        // and hold at least `capacity` elements.
        Some(unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), self.capacity) })
    }

    fn host_elements_mut(&mut self) -> Option<&mut [T]> {
        let capacity = self.capacity;
        let bytes = self.raw.as_mut()?.host_mut()?;
        // SAFETY: as in host_elements, with a unique borrow.
        Some(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), capacity) })
    }

    fn read_into(&self, index: usize, dst: &mut [T]) -> Result<()> {
        match self.raw.as_ref() {
            Some(raw) => raw.read(index * size_of::<T>(), bytes_of_mut(dst)),
            None => SizeMismatchSnafu { expected: index + dst.len(), actual: 0usize }.fail(),
        }
    }

    fn write_from(&mut self, index: usize, src: &[T]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        match self.raw.as_mut() {
            Some(raw) => raw.write(index * size_of::<T>(), bytes_of(src)),
            None => SizeMismatchSnafu { expected: index + src.len(), actual: 0usize }.fail(),
        }
    }

    fn write_repeated(&mut self, index: usize, count: usize, value: T) -> Result<()> {
        if let Some(values) = self.host_elements_mut() {
            values[index..index + count].fill(value);
            return Ok(());
        }
        self.write_from(index, &vec![value; count])
    }
}

impl<T: Element> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Element> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("dtype", &T::DTYPE)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}
