use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The closed set of element types a variable can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DataType {
    pub const fn byte_width(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::I8 => "int8_t",
            Self::I16 => "int16_t",
            Self::I32 => "int32_t",
            Self::I64 => "int64_t",
            Self::U8 => "uint8_t",
            Self::U16 => "uint16_t",
            Self::U32 => "uint32_t",
            Self::U64 => "uint64_t",
            Self::F32 => "float",
            Self::F64 => "double",
        };
        write!(f, "{name}")
    }
}

mod private {
    pub trait Sealed {}
}

/// A primitive Rust type with a [`DataType`] tag.
///
/// Values are moved to and from byte buffers in host byte order; readers swap the bytes of
/// datasets written on a host of the other order before decoding.
pub trait NativeType:
    private::Sealed + Copy + Default + Debug + PartialEq + Send + Sync + 'static
{
    const DTYPE: DataType;

    fn extend_bytes(values: &[Self], out: &mut Vec<u8>);

    /// Decode `bytes`, whose length must be a multiple of the type's width.
    fn from_bytes(bytes: &[u8]) -> Vec<Self>;
}

macro_rules! native_type {
    ($T:ty, $dtype:ident) => {
        impl private::Sealed for $T {}

        impl NativeType for $T {
            const DTYPE: DataType = DataType::$dtype;

            fn extend_bytes(values: &[Self], out: &mut Vec<u8>) {
                out.reserve(values.len() * size_of::<$T>());
                for value in values {
                    out.extend_from_slice(&value.to_ne_bytes());
                }
            }

            fn from_bytes(bytes: &[u8]) -> Vec<Self> {
                bytes
                    .chunks_exact(size_of::<$T>())
                    .map(|chunk| {
                        let mut raw = [0u8; size_of::<$T>()];
                        raw.copy_from_slice(chunk);
                        <$T>::from_ne_bytes(raw)
                    })
                    .collect()
            }
        }
    };
}

native_type!(i8, I8);
native_type!(i16, I16);
native_type!(i32, I32);
native_type!(i64, I64);
native_type!(u8, U8);
native_type!(u16, U16);
native_type!(u32, U32);
native_type!(u64, U64);
native_type!(f32, F32);
native_type!(f64, F64);

/// Reverse the bytes of every `width`-byte element of `bytes` in place.
pub fn swap_elements(bytes: &mut [u8], width: usize) {
    if width <= 1 {
        return;
    }
    for element in bytes.chunks_exact_mut(width) {
        element.reverse();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DataType::I8, 1)]
    #[case(DataType::U16, 2)]
    #[case(DataType::F32, 4)]
    #[case(DataType::I64, 8)]
    #[case(DataType::F64, 8)]
    fn widths(#[case] dtype: DataType, #[case] width: usize) {
        assert_eq!(dtype.byte_width(), width);
    }

    #[test]
    fn native_bytes_round_trip() {
        let values = [1.5f64, -2.25, f64::MAX];
        let mut bytes = Vec::new();
        f64::extend_bytes(&values, &mut bytes);
        assert_eq!(bytes.len(), 24);
        assert_eq!(f64::from_bytes(&bytes), values);
        assert_eq!(<f64 as NativeType>::DTYPE, DataType::F64);
    }

    #[test]
    fn swapped_big_endian_matches_native() {
        let values = [0x0102_0304_u32, 0xa0b0_c0d0];
        let mut big: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        if cfg!(target_endian = "little") {
            swap_elements(&mut big, 4);
        }
        assert_eq!(u32::from_bytes(&big), values);
    }

    #[test]
    fn display_names() {
        assert_eq!(DataType::F64.to_string(), "double");
        assert_eq!(DataType::U32.to_string(), "uint32_t");
    }
}
