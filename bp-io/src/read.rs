use std::io;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

/// A trait for types that support positional reads.
///
/// References to the type must be safe to [share across threads][Send]: the read executor
/// fetches several subfiles in parallel through shared handles.
pub trait BpReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `pos`, returning the number of bytes read.
    ///
    /// A return value of zero with a non-empty buffer means the end of the data was reached.
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize>;

    /// Fill as much of `buf` as the underlying data allows, retrying partial and interrupted
    /// reads. Returns the number of bytes filled, which is only smaller than `buf.len()` when
    /// the end of the data was reached.
    fn read_fully_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_at(&mut buf[filled..], pos + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Read exactly the given byte range. Results will be returned as [`Bytes`].
    ///
    /// If the reader does not have the requested number of bytes, the call fails with an
    /// [`UnexpectedEof`][io::ErrorKind::UnexpectedEof].
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = usize::try_from(range.end.saturating_sub(range.start))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut buffer = BytesMut::zeroed(len);
        let filled = self.read_fully_at(&mut buffer, range.start)?;
        if filled < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read {filled} of {len} bytes at offset {}",
                    range.start
                ),
            ));
        }
        Ok(buffer.freeze())
    }

    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::default()
    }

    /// Get the number of bytes of data readable.
    fn size(&self) -> io::Result<u64>;
}

pub struct PerformanceHint {
    coalescing_window: u64,
}

impl Default for PerformanceHint {
    fn default() -> Self {
        Self {
            coalescing_window: 1 << 20,
        }
    }
}

impl PerformanceHint {
    pub fn new(coalescing_window: u64) -> Self {
        Self { coalescing_window }
    }

    /// Creates a new instance with a profile appropriate for fast local storage, like memory or files on NVMe devices.
    pub fn local() -> Self {
        Self::new(0)
    }

    /// The maximum distance between two reads that should coalesced into a single operation.
    pub fn coalescing_window(&self) -> u64 {
        self.coalescing_window
    }
}

impl<T: BpReadAt + ?Sized> BpReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        T::read_at(self, buf, pos)
    }

    fn performance_hint(&self) -> PerformanceHint {
        T::performance_hint(self)
    }

    fn size(&self) -> io::Result<u64> {
        T::size(self)
    }
}

impl BpReadAt for Bytes {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let start = usize::try_from(pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let start = usize::try_from(range.start)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let end = usize::try_from(range.end)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if end > self.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected eof"));
        }
        Ok(self.slice(start..end))
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::local()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::BpReadAt;

    #[test]
    fn bytes_read_range() {
        let bytes = Bytes::from("0123456789");
        assert_eq!(bytes.read_byte_range(2..5).unwrap(), Bytes::from("234"));
        assert_eq!(
            bytes.read_byte_range(8..12).unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn bytes_read_fully_stops_at_end() {
        let bytes = Bytes::from("0123456789");
        let mut buf = [0u8; 6];
        assert_eq!(bytes.read_fully_at(&mut buf, 7).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
    }
}
