//! Little-endian, bounds-checked reading and writing of primitive values.
//!
//! CIL method bodies, exception-handler sections and metadata signature blobs are all
//! little-endian. Everything in this module returns [`crate::Error::OutOfBounds`] instead of
//! panicking when a buffer is too short, which keeps the rewriter fail-open on truncated or
//! hostile input.
//!
//! # Key Components
//!
//! - [`CilIO`] - Trait describing how a primitive converts from and to its byte representation
//! - [`read_le`] / [`read_le_at`] - Read a value from the start of, or at an offset into, a slice
//! - [`push_le`] - Append a value to a growable buffer
//! - [`write_compressed_uint`] - ECMA-335 II.23.2 compressed unsigned integer encoding
//!
//! # Examples
//!
//! ```rust
//! use dotweave::utils::io::{push_le, read_le_at};
//!
//! let mut data = Vec::new();
//! push_le(&mut data, 0x0102_u16);
//! push_le(&mut data, 0x0304_0506_u32);
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x0102);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0x0304_0506);
//! # Ok::<(), dotweave::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary data reading and writing.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait CilIO: Sized {
    /// Associated byte-array type for this primitive
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode into little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty),*) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Safely reads a value of type `T` in little-endian byte order from the start of a slice.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the slice holds fewer than `size_of::<T>()` bytes.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would cross the end of `data`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Appends `value` in little-endian byte order to a growable buffer.
pub fn push_le<T: CilIO>(data: &mut Vec<u8>, value: T) {
    data.extend_from_slice(value.to_le_bytes().as_ref());
}

/// Appends an ECMA-335 compressed unsigned integer (II.23.2).
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`, which the format
/// cannot represent.
pub fn write_compressed_uint(data: &mut Vec<u8>, value: u32) -> Result<()> {
    match value {
        0..=0x7F => data.push(value as u8),
        0x80..=0x3FFF => {
            data.push(((value >> 8) as u8) | 0x80);
            data.push(value as u8);
        }
        0x4000..=0x1FFF_FFFF => {
            data.push(((value >> 24) as u8) | 0xC0);
            data.push((value >> 16) as u8);
            data.push((value >> 8) as u8);
            data.push(value as u8);
        }
        _ => {
            return Err(malformed_error!(
                "Value {:#x} is too large for compressed encoding",
                value
            ))
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn read_le_primitives() {
        let data = [0x2A, 0x00, 0x00, 0x70, 0xFF];
        assert_eq!(read_le::<u8>(&data).unwrap(), 0x2A);
        assert_eq!(read_le::<u32>(&data).unwrap(), 0x7000_002A);

        let mut offset = 4;
        assert_eq!(read_le_at::<i8>(&data, &mut offset).unwrap(), -1);
        assert_eq!(offset, 5);
    }

    #[test]
    fn read_le_out_of_bounds() {
        let data = [0x01, 0x02];
        assert!(matches!(read_le::<u32>(&data), Err(Error::OutOfBounds)));

        let mut offset = usize::MAX;
        assert!(matches!(
            read_le_at::<u8>(&data, &mut offset),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn compressed_uint_boundaries() {
        let mut data = Vec::new();
        write_compressed_uint(&mut data, 0x03).unwrap();
        write_compressed_uint(&mut data, 0x80).unwrap();
        write_compressed_uint(&mut data, 0x4000).unwrap();
        assert_eq!(data, [0x03, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00]);

        assert!(write_compressed_uint(&mut data, 0x2000_0000).is_err());
    }
}
