use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;

use bp_error::{BpResult, bp_err};
use memmap2::MmapMut;

/// A zero-initialised memory segment mapped by every rank of a communicator.
///
/// The window only hands out a raw base pointer. Structure on top of it (control words,
/// buffers) is the caller's business, as is synchronising access to the bytes.
pub struct SharedWindow {
    ptr: NonNull<u8>,
    len: usize,
    // Keeps the mapping alive, the pointer above points into it.
    _map: MmapMut,
}

// SAFETY: the window is plain memory. All interior access goes through raw pointers and the
// users of the window synchronise through atomics placed inside it.
unsafe impl Send for SharedWindow {}
// SAFETY: see above.
unsafe impl Sync for SharedWindow {}

impl SharedWindow {
    /// Map an anonymous segment of `len` bytes.
    pub fn anonymous(len: usize) -> BpResult<Self> {
        let mut map = MmapMut::map_anon(len.max(1))
            .map_err(|e| bp_err!(Comm: "failed to allocate a {len} byte shared window: {e}"))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| bp_err!(Comm: "shared window mapped at a null address"))?;
        Ok(Self {
            ptr,
            len,
            _map: map,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the segment. Mappings are page aligned.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Debug for SharedWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWindow")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::SharedWindow;

    #[test]
    fn anonymous_windows_are_zeroed() {
        let window = SharedWindow::anonymous(4096).unwrap();
        assert_eq!(window.len(), 4096);
        // SAFETY: the window is 4096 bytes long and nobody else references it.
        let bytes = unsafe { std::slice::from_raw_parts(window.as_mut_ptr(), window.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(window.as_mut_ptr() as usize % 4096, 0);
    }
}
