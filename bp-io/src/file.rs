use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{BpReadAt, BpWrite, PerformanceHint};

/// A cheaply cloneable file handle for positional reads and writes.
///
/// We use this because `std::fs::File` is not `Clone`, and every IO we issue carries its own
/// offset so a shared handle is all we need.
#[derive(Debug, Clone)]
pub struct FileTransport {
    file: Arc<File>,
    path: Arc<Path>,
}

impl FileTransport {
    /// Open a file on the current file system for reading.
    ///
    /// The `FileTransport` takes ownership of the file descriptor, and can be cloned
    /// many times without opening a new file descriptor. When the last instance
    /// is dropped, the file descriptor is closed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::new(file, path))
    }

    /// Create (or truncate) a file for writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file, path))
    }

    /// Open a file for writing without truncating it, creating it if it does not exist.
    pub fn open_write(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file, path))
    }

    fn new(file: File, path: &Path) -> Self {
        Self {
            file: Arc::new(file),
            path: Arc::from(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.path.to_path_buf()
    }

    /// Truncate or extend the file to exactly `len` bytes.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

// Implement deref coercion for non-mut `File` methods on `FileTransport`.
impl Deref for FileTransport {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl BpReadAt for FileTransport {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, buf), fields(len = buf.len())))]
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        FileExt::read_at(self.file.as_ref(), buf, pos)
    }

    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::local()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    fn size(&self) -> io::Result<u64> {
        self.file.metadata().map(|metadata| metadata.len())
    }
}

impl BpWrite for FileTransport {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, buffer), fields(len = buffer.len())))]
    fn write_all_at(&self, buffer: &[u8], pos: u64) -> io::Result<()> {
        FileExt::write_all_at(self.file.as_ref(), buffer, pos)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|metadata| metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::ops::Deref;
    use std::os::unix::fs::FileExt;

    use tempfile::NamedTempFile;

    use crate::{BpReadAt, BpWrite, FileTransport};

    #[test]
    fn test_shared_file() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        write!(tmpfile, "0123456789").unwrap();

        let shared_file = FileTransport::open(tmpfile.path()).unwrap();

        let first_half = shared_file.read_byte_range(0..5).unwrap();
        let second_half = shared_file.read_byte_range(5..10).unwrap();

        assert_eq!(&first_half, "01234".as_bytes());
        assert_eq!(&second_half, "56789".as_bytes());
    }

    #[test]
    fn test_drop_semantics() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "test123").unwrap();

        // Transfer ownership of the file into our transport.
        let transport = FileTransport::open(file.path()).unwrap();
        // Delete the file, so that the transport's owned FD is the only thing keeping it around.
        std::fs::remove_file(file.path()).unwrap();

        // Create a function to test if the file is still open.
        let can_read = |file: &File| {
            let mut buffer = vec![0; 7];
            file.read_exact_at(&mut buffer, 0).is_ok()
        };

        assert!(can_read(transport.deref()));

        let clone = transport.clone();
        drop(transport);
        assert!(can_read(&clone));
    }

    #[test]
    fn positional_writes_extend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.0");
        let transport = FileTransport::create(&path).unwrap();
        transport.write_all_at(b"tail", 8).unwrap();
        transport.write_all_at(b"head", 0).unwrap();
        assert_eq!(transport.len().unwrap(), 12);

        let reopened = FileTransport::open_write(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 12);
        let bytes = reopened.read_byte_range(0..12).unwrap();
        assert_eq!(&bytes[..4], b"head");
        assert_eq!(&bytes[4..8], &[0u8; 4]);
        assert_eq!(&bytes[8..], b"tail");
    }
}
