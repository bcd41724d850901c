use std::io;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{BpReadAt, BpWrite, PerformanceHint};

/// A growable in-memory transport, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    buffer: Arc<RwLock<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(data)),
        }
    }

    /// A copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.read().clone()
    }

    pub fn truncate(&self, len: usize) {
        self.buffer.write().truncate(len);
    }
}

impl BpReadAt for MemoryTransport {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let data = self.buffer.read();
        let start = usize::try_from(pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::local()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.buffer.read().len() as u64)
    }
}

impl BpWrite for MemoryTransport {
    fn write_all_at(&self, buffer: &[u8], pos: u64) -> io::Result<()> {
        let pos = usize::try_from(pos).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut data = self.buffer.write();
        let end = pos + buffer.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(buffer);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.buffer.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use crate::{BpReadAt, BpWrite, MemoryTransport};

    #[test]
    fn clones_share_contents() {
        let transport = MemoryTransport::new();
        let clone = transport.clone();
        transport.write_all_at(b"abc", 2).unwrap();
        assert_eq!(clone.to_vec(), b"\0\0abc");
        assert_eq!(clone.read_byte_range(2..5).unwrap().as_ref(), b"abc");
    }
}
