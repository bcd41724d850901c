//! Fixed-width integer codec with an explicit byte order.
//!
//! Every integer in the index, the metadata file and the meta-metadata file is stored in the
//! byte order of the host that wrote the dataset, recorded in the header's endianness flag.

use std::fmt::{Display, Formatter};

use bp_error::{BpResult, bp_bail, bp_err};

/// Byte order of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// The byte order of the host we are running on.
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    pub const fn is_native(self) -> bool {
        matches!(
            (self, Self::native()),
            (Self::Little, Self::Little) | (Self::Big, Self::Big)
        )
    }

    /// The value stored in the header's endianness byte.
    pub const fn flag(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }

    pub fn from_flag(flag: u8) -> BpResult<Self> {
        match flag {
            0 => Ok(Self::Little),
            1 => Ok(Self::Big),
            other => Err(bp_err!(IncompatibleFormat: "invalid endianness flag {other}")),
        }
    }
}

impl Display for Endianness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Little => write!(f, "little-endian"),
            Self::Big => write!(f, "big-endian"),
        }
    }
}

/// An unsigned integer with a fixed on-disk width.
pub trait FixedWidth: Copy {
    const WIDTH: usize;

    fn encode(self, endianness: Endianness, out: &mut [u8]);

    fn decode(bytes: &[u8], endianness: Endianness) -> Self;
}

macro_rules! fixed_width {
    ($($T:ty),*) => {
        $(
            impl FixedWidth for $T {
                const WIDTH: usize = size_of::<$T>();

                fn encode(self, endianness: Endianness, out: &mut [u8]) {
                    let bytes = match endianness {
                        Endianness::Little => self.to_le_bytes(),
                        Endianness::Big => self.to_be_bytes(),
                    };
                    out[..Self::WIDTH].copy_from_slice(&bytes);
                }

                fn decode(bytes: &[u8], endianness: Endianness) -> Self {
                    let mut raw = [0u8; size_of::<$T>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    match endianness {
                        Endianness::Little => <$T>::from_le_bytes(raw),
                        Endianness::Big => <$T>::from_be_bytes(raw),
                    }
                }
            }
        )*
    };
}

fixed_width!(u8, u16, u32, u64);

/// A growable buffer written at an explicit position.
///
/// Writes grow the buffer as needed and advance the position; `put_at` patches an earlier
/// location without moving it.
#[derive(Debug, Clone)]
pub struct FormatBuffer {
    data: Vec<u8>,
    position: usize,
    endianness: Endianness,
}

impl FormatBuffer {
    pub fn new(endianness: Endianness) -> Self {
        Self::with_capacity(endianness, 0)
    }

    pub fn with_capacity(endianness: Endianness, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            position: 0,
            endianness,
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn reserve_to(&mut self, end: usize) {
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
    }

    pub fn put<T: FixedWidth>(&mut self, value: T) {
        let position = self.position;
        self.put_at(position, value);
        self.position += T::WIDTH;
    }

    pub fn put_at<T: FixedWidth>(&mut self, position: usize, value: T) {
        self.reserve_to(position + T::WIDTH);
        value.encode(self.endianness, &mut self.data[position..]);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        self.reserve_to(end);
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Write `value` into a field of exactly `width` bytes, zero padded.
    pub fn put_padded(&mut self, value: &[u8], width: usize) {
        let take = value.len().min(width);
        self.put_bytes(&value[..take]);
        self.put_bytes(&vec![0u8; width - take]);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// A cursor decoding fixed-width values from a borrowed slice.
#[derive(Debug, Clone)]
pub struct FormatReader<'a> {
    data: &'a [u8],
    position: usize,
    endianness: Endianness,
}

impl<'a> FormatReader<'a> {
    pub fn new(data: &'a [u8], endianness: Endianness) -> Self {
        Self {
            data,
            position: 0,
            endianness,
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn get<T: FixedWidth>(&mut self) -> BpResult<T> {
        let value = self.get_at(self.position)?;
        self.position += T::WIDTH;
        Ok(value)
    }

    pub fn get_at<T: FixedWidth>(&self, position: usize) -> BpResult<T> {
        let end = position + T::WIDTH;
        if end > self.data.len() {
            bp_bail!(OutOfBounds: end, 0, self.data.len());
        }
        Ok(T::decode(&self.data[position..end], self.endianness))
    }

    pub fn get_bytes(&mut self, len: usize) -> BpResult<&'a [u8]> {
        let end = self.position + len;
        if end > self.data.len() {
            bp_bail!(OutOfBounds: end, 0, self.data.len());
        }
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

/// Round `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Endianness::Little)]
    #[case(Endianness::Big)]
    fn positional_writes(#[case] endianness: Endianness) {
        let mut buffer = FormatBuffer::new(endianness);
        buffer.put(7u8);
        buffer.put(0x0102u16);
        buffer.put(0x0304_0506u32);
        buffer.put(u64::MAX - 1);
        buffer.put_at(0, 9u8);
        assert_eq!(buffer.len(), 15);
        assert_eq!(buffer.position(), 15);

        let mut reader = FormatReader::new(buffer.as_slice(), endianness);
        assert_eq!(reader.get::<u8>().unwrap(), 9);
        assert_eq!(reader.get::<u16>().unwrap(), 0x0102);
        assert_eq!(reader.get::<u32>().unwrap(), 0x0304_0506);
        assert_eq!(reader.get::<u64>().unwrap(), u64::MAX - 1);
        assert!(reader.get::<u8>().is_err());
    }

    #[test]
    fn big_endian_decodes_to_native_values() {
        let mut big = FormatBuffer::new(Endianness::Big);
        big.put(0xdead_beef_u32);
        assert_eq!(big.as_slice(), &[0xde, 0xad, 0xbe, 0xef]);
        let reader = FormatReader::new(big.as_slice(), Endianness::Big);
        assert_eq!(reader.get_at::<u32>(0).unwrap(), 0xdead_beef);

        let mut native = FormatBuffer::new(Endianness::native());
        native.put(0xdead_beef_u32);
        let reader = FormatReader::new(native.as_slice(), Endianness::native());
        assert_eq!(reader.get_at::<u32>(0).unwrap(), 0xdead_beef);
    }

    #[test]
    fn padded_fields() {
        let mut buffer = FormatBuffer::new(Endianness::Little);
        buffer.put_padded(b"BP v", 8);
        assert_eq!(buffer.as_slice(), b"BP v\0\0\0\0");
    }

    #[rstest]
    #[case(0, 4096, 0)]
    #[case(1, 4096, 4096)]
    #[case(4096, 4096, 4096)]
    #[case(4097, 4096, 8192)]
    #[case(13, 1, 13)]
    fn alignment(#[case] value: u64, #[case] align: u64, #[case] expected: u64) {
        assert_eq!(align_up(value, align), expected);
    }
}
