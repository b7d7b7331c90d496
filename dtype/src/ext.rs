use std::fmt::Debug;

use super::*;

pub trait HasDType {
    const DTYPE: ScalarDType;
}

mod sealed {
    pub trait Sealed {}
}

/// A plain numeric value that may be stored in device memory.
///
/// The trait is sealed: every implementor is a primitive for which any bit
/// pattern of `size_of::<Self>()` bytes is a valid value and all-zero bytes
/// equal `Self::default()`. Device buffers rely on both facts when they
/// reinterpret raw allocations.
pub trait Element: sealed::Sealed + HasDType + Copy + Default + PartialEq + Send + Sync + Debug + 'static {
    /// Lossy widening used by diagnostics (row sums).
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl HasDType for $ty { const DTYPE: ScalarDType = $dtype; }
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                #[inline]
                fn to_f64(self) -> f64 { self as f64 }
            }
        )*
    };
}

impl_element! {
    i8 => ScalarDType::Int8, i16 => ScalarDType::Int16, i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    u8 => ScalarDType::UInt8, u16 => ScalarDType::UInt16, u32 => ScalarDType::UInt32, u64 => ScalarDType::UInt64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}
