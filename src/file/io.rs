//! Bounds-checked little-endian reading and writing of primitive integers.
//!
//! Every routine in this crate that touches raw image bytes, decrypted streams or
//! method records goes through these helpers, so an adversarial length field can only
//! ever produce [`crate::Error::OutOfBounds`], never a panic.
//!
//! # Examples
//!
//! ```rust
//! use dotreclaim::file::io::{push_le, read_le_at};
//!
//! let mut data = Vec::new();
//! push_le(&mut data, 0x0201u16);
//! push_le(&mut data, 0x06050403u32);
//! assert_eq!(data, [1, 2, 3, 4, 5, 6]);
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x0201);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0x06050403);
//! assert!(read_le_at::<u8>(&data, &mut offset).is_err());
//! # Ok::<(), dotreclaim::Error>(())
//! ```

use crate::Result;

/// Trait for primitive integers that can be converted from and to little-endian byte arrays.
pub trait CilIO: Sized + Copy {
    /// Width of the encoded value in bytes.
    const SIZE: usize;

    /// Decode from exactly [`CilIO::SIZE`] little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encode into exactly [`CilIO::SIZE`] little-endian bytes.
    fn write_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_cil_io {
    ($($ty:ty),*) => {
        $(
            impl CilIO for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le_slice(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_cil_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Safely reads `T` from the start of `data` in little-endian.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads `T` at `offset` in little-endian and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let end = offset
        .checked_add(T::SIZE)
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let value = T::from_le_slice(&data[*offset..end]);
    *offset = end;
    Ok(value)
}

/// Appends `value` in little-endian to a growable buffer.
pub fn push_le<T: CilIO>(out: &mut Vec<u8>, value: T) {
    let start = out.len();
    out.resize(start + T::SIZE, 0);
    value.write_le_slice(&mut out[start..]);
}
