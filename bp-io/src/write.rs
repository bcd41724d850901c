use std::io;
use std::sync::Arc;

/// A positional writer.
///
/// Writers in a BP dataset never share a cursor: every write names its absolute offset,
/// so several ranks may write disjoint regions of one subfile through their own handles.
pub trait BpWrite: Send + Sync {
    /// Write the whole buffer at `pos`, extending the target if needed.
    fn write_all_at(&self, buffer: &[u8], pos: u64) -> io::Result<()>;

    /// Push buffered data to the underlying storage.
    fn flush(&self) -> io::Result<()>;

    /// The current length of the target, used to append.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<T: BpWrite + ?Sized> BpWrite for Arc<T> {
    fn write_all_at(&self, buffer: &[u8], pos: u64) -> io::Result<()> {
        T::write_all_at(self, buffer, pos)
    }

    fn flush(&self) -> io::Result<()> {
        T::flush(self)
    }

    fn len(&self) -> io::Result<u64> {
        T::len(self)
    }
}
