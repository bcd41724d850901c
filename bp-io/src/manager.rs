use std::fmt::{Debug, Formatter};
use std::io;
use std::ops::Range;
use std::sync::Arc;

use bp_error::{BpResult, WithContext};
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{BpReadAt, BpWrite, read_byte_ranges, read_exact};

type Opener<T> = dyn Fn(usize) -> io::Result<T> + Send + Sync;

/// An open transport together with the name used in error messages.
#[derive(Debug)]
pub struct NamedTransport<T> {
    name: String,
    transport: T,
}

impl<T> NamedTransport<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Owns the transports of a dataset's subfiles, keyed by subfile index.
///
/// Subfiles are opened on first access and then retained until [`TransportMan::close_all`]
/// (or until evicted because [`TransportMan::with_max_open`] caps the number of simultaneously
/// open subfiles). Subfiles that are never referenced are never opened.
pub struct TransportMan<T> {
    opener: Box<Opener<T>>,
    namer: Box<dyn Fn(usize) -> String + Send + Sync>,
    transports: Mutex<FxHashMap<usize, Arc<NamedTransport<T>>>>,
    max_open: Option<usize>,
}

impl<T> Debug for TransportMan<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMan")
            .field("open", &self.open_count())
            .field("max_open", &self.max_open)
            .finish()
    }
}

impl<T> TransportMan<T> {
    /// Create a manager that opens subfile `id` with `opener`, naming it `namer(id)` in errors.
    pub fn new<O, N>(opener: O, namer: N) -> Self
    where
        O: Fn(usize) -> io::Result<T> + Send + Sync + 'static,
        N: Fn(usize) -> String + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            namer: Box::new(namer),
            transports: Mutex::new(FxHashMap::default()),
            max_open: None,
        }
    }

    /// Cap the number of subfiles held open at once. Zero means unlimited.
    pub fn with_max_open(mut self, max_open: usize) -> Self {
        self.max_open = (max_open > 0).then_some(max_open);
        self
    }

    /// Return the transport for subfile `id`, opening it if this is the first access.
    pub fn get_or_open(&self, id: usize) -> BpResult<Arc<NamedTransport<T>>> {
        let mut transports = self.transports.lock();
        if let Some(existing) = transports.get(&id) {
            return Ok(existing.clone());
        }

        if let Some(max_open) = self.max_open {
            while transports.len() >= max_open {
                // Evict the lowest open subfile index.
                let Some(victim) = transports.keys().min().copied() else {
                    break;
                };
                log::debug!("closing subfile {victim} to stay under {max_open} open files");
                transports.remove(&victim);
            }
        }

        let name = (self.namer)(id);
        log::debug!("opening subfile {id} ({name})");
        let transport = (self.opener)(id)
            .map_err(bp_error::BpError::from)
            .with_context(|| format!("failed to open subfile {name}"))?;
        let transport = Arc::new(NamedTransport { name, transport });
        transports.insert(id, transport.clone());
        Ok(transport)
    }

    pub fn is_open(&self, id: usize) -> bool {
        self.transports.lock().contains_key(&id)
    }

    pub fn open_count(&self) -> usize {
        self.transports.lock().len()
    }

    /// Indices of the currently open subfiles, in ascending order.
    pub fn open_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.transports.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn close(&self, id: usize) {
        self.transports.lock().remove(&id);
    }

    pub fn close_all(&self) {
        self.transports.lock().clear();
    }
}

impl<T: BpReadAt> TransportMan<T> {
    /// Read exactly `range` from subfile `id`.
    pub fn read(&self, id: usize, range: Range<u64>) -> BpResult<Bytes> {
        let transport = self.get_or_open(id)?;
        read_exact(&transport.transport, &transport.name, range)
    }

    /// Read several ranges from subfile `id`, coalescing reads closer than `max_gap`.
    pub fn read_ranges(
        &self,
        id: usize,
        ranges: &[Range<u64>],
        max_gap: u64,
    ) -> BpResult<Vec<Bytes>> {
        let transport = self.get_or_open(id)?;
        read_byte_ranges(&transport.transport, &transport.name, ranges, max_gap)
    }

    pub fn size(&self, id: usize) -> BpResult<u64> {
        let transport = self.get_or_open(id)?;
        Ok(transport.transport.size()?)
    }
}

impl<T: BpWrite> TransportMan<T> {
    pub fn write_at(&self, id: usize, buffer: &[u8], pos: u64) -> BpResult<()> {
        let transport = self.get_or_open(id)?;
        transport
            .transport
            .write_all_at(buffer, pos)
            .map_err(bp_error::BpError::from)
            .with_context(|| format!("failed to write {} bytes to {}", buffer.len(), transport.name))
    }

    pub fn flush_all(&self) -> BpResult<()> {
        let transports: Vec<_> = self.transports.lock().values().cloned().collect();
        for transport in transports {
            transport.transport.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bp_error::BpError;
    use rstest::rstest;

    use crate::{BpWrite, MemoryTransport, TransportMan};

    fn manager(opened: Arc<AtomicUsize>) -> TransportMan<MemoryTransport> {
        TransportMan::new(
            move |id| {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(MemoryTransport::from_vec(vec![u8::try_from(id).unwrap(); 16]))
            },
            |id| format!("data.{id}"),
        )
    }

    #[test]
    fn opens_lazily_and_reuses() {
        let opened = Arc::new(AtomicUsize::new(0));
        let man = manager(opened.clone());
        assert_eq!(man.open_count(), 0);
        assert_eq!(man.read(3, 0..4).unwrap().as_ref(), &[3u8; 4]);
        assert_eq!(man.read(3, 4..8).unwrap().as_ref(), &[3u8; 4]);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(man.open_ids(), vec![3]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn caps_open_subfiles(#[case] max_open: usize) {
        let opened = Arc::new(AtomicUsize::new(0));
        let man = manager(opened).with_max_open(max_open);
        for id in 0..4 {
            man.read(id, 0..1).unwrap();
            assert!(man.open_count() <= max_open);
            assert!(man.is_open(id));
        }
    }

    #[test]
    fn short_read_reports_subfile() {
        let man = manager(Arc::new(AtomicUsize::new(0)));
        let err = man.read(1, 10..20).unwrap_err();
        assert!(matches!(err, BpError::IoTruncated { offset: 10, .. }));
        assert!(err.to_string().contains("data.1"));
    }

    #[test]
    fn writes_go_to_the_same_handle() {
        let man = manager(Arc::new(AtomicUsize::new(0)));
        man.write_at(0, b"xy", 16).unwrap();
        let transport = man.get_or_open(0).unwrap();
        assert_eq!(transport.transport().len().unwrap(), 18);
        assert_eq!(transport.name(), "data.0");
    }
}
