use std::hint::spin_loop;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bp_comm::SharedWindow;
use bp_error::{BpResult, bp_bail};
use static_assertions::const_assert;

/// Default capacity of each of the two staging buffers.
pub const DEFAULT_SHM_BUFFER_SIZE: usize = 4 << 20;

const DATA_ALIGNMENT: usize = 64;

/// Which buffer a side of the double buffer used last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LastBufferUsed {
    None = 0,
    A = 1,
    B = 2,
}

impl LastBufferUsed {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::A,
            2 => Self::B,
            _ => Self::None,
        }
    }

    /// The buffer after this one in the A, B, A, ... rotation.
    fn next(self) -> Self {
        match self {
            Self::None | Self::B => Self::A,
            Self::A => Self::B,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::None | Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Who currently holds a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Holder {
    Nobody = 0,
    Producer = 1,
    Consumer = 2,
}

impl Holder {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Producer,
            2 => Self::Consumer,
            _ => Self::Nobody,
        }
    }
}

/// Busy-wait tuning for the buffer spinlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Spins before sleeping once.
    pub spin_limit: u32,
    /// Sleep between bursts of spinning.
    pub backoff: Duration,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spin_limit: 1000,
            backoff: Duration::from_micros(10),
        }
    }
}

impl SpinConfig {
    fn pause(&self, spins: &mut u32) {
        *spins += 1;
        if *spins >= self.spin_limit {
            std::thread::sleep(self.backoff);
            *spins = 0;
        } else {
            spin_loop();
        }
    }
}

/// Control words at the start of the shared window. All-zero is the initial state.
#[repr(C)]
struct ShmControl {
    producer_buffer: AtomicU8,
    consumer_buffer: AtomicU8,
    locks: [AtomicBool; 2],
    full: [AtomicBool; 2],
    holders: [AtomicU8; 2],
    full_count: AtomicU32,
    violations: AtomicU32,
    sizes: [AtomicU64; 2],
}

const CONTROL_LEN: usize = size_of::<ShmControl>().next_multiple_of(DATA_ALIGNMENT);
const_assert!(CONTROL_LEN <= 4096);

/// Two fixed-size buffers in shared memory, passed back and forth between the producers of an
/// aggregator group and its consumer.
///
/// A producer takes the buffer after the one it used last, waits until the consumer has
/// emptied it, fills it and marks it full. The consumer walks the buffers in the same order,
/// waits for each to be full, drains it and marks it empty. Each buffer has its own spinlock,
/// so a producer can fill one buffer while the consumer writes out the other.
///
/// Producers of one group must take turns (the writer passes a token in rank order); the
/// segment itself supports one producer and one consumer at a time.
#[derive(Debug, Clone)]
pub struct ShmSegment {
    window: Arc<SharedWindow>,
    buffer_size: usize,
    spin: SpinConfig,
}

impl ShmSegment {
    /// Bytes of shared window needed for two buffers of `buffer_size`.
    pub fn required_len(buffer_size: usize) -> usize {
        CONTROL_LEN + 2 * buffer_size.next_multiple_of(DATA_ALIGNMENT)
    }

    pub fn new(window: Arc<SharedWindow>, buffer_size: usize, spin: SpinConfig) -> BpResult<Self> {
        if buffer_size == 0 {
            bp_bail!(InvalidArgument: "shared-memory buffers must not be empty");
        }
        if window.len() < Self::required_len(buffer_size) {
            bp_bail!(
                InvalidArgument: "shared window of {} bytes cannot hold two {buffer_size} byte buffers",
                window.len()
            );
        }
        Ok(Self {
            window,
            buffer_size,
            spin,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn control(&self) -> &ShmControl {
        // SAFETY: the window is page aligned, at least CONTROL_LEN bytes long, zero
        // initialised (a valid state for every field) and outlives `self`. All fields are
        // atomics, so shared references from several ranks are sound.
        unsafe { &*(self.window.as_mut_ptr() as *const ShmControl) }
    }

    fn lock(&self, index: usize) {
        let lock = &self.control().locks[index];
        let mut spins = 0;
        while lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.spin.pause(&mut spins);
        }
    }

    fn unlock(&self, index: usize) {
        self.control().locks[index].store(false, Ordering::Release);
    }

    /// Lock buffer `index` once its full flag equals `want_full`.
    fn lock_when(&self, index: usize, want_full: bool) {
        let mut spins = 0;
        loop {
            self.lock(index);
            if self.control().full[index].load(Ordering::Acquire) == want_full {
                return;
            }
            self.unlock(index);
            self.spin.pause(&mut spins);
        }
    }

    fn claim(&self, index: usize, holder: Holder) {
        let previous = self.control().holders[index].swap(holder as u8, Ordering::AcqRel);
        if previous != Holder::Nobody as u8 {
            self.control().violations.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "buffer {index} claimed by {holder:?} while held by {:?}",
                Holder::from_u8(previous)
            );
        }
    }

    fn release(&self, index: usize) {
        self.control().holders[index].store(Holder::Nobody as u8, Ordering::Release);
    }

    /// The producer side: take the next buffer once it is empty.
    pub fn lock_producer_buffer(&self) -> ProducerBuffer<'_> {
        let control = self.control();
        let which = LastBufferUsed::from_u8(control.producer_buffer.load(Ordering::Acquire)).next();
        control.producer_buffer.store(which as u8, Ordering::Release);
        let index = which.index();
        self.lock_when(index, false);
        self.claim(index, Holder::Producer);
        ProducerBuffer {
            segment: self,
            index,
            len: 0,
        }
    }

    /// The consumer side: take the next buffer once a producer has filled it.
    pub fn lock_consumer_buffer(&self) -> ConsumerBuffer<'_> {
        let control = self.control();
        let mut spins = 0;
        while control.producer_buffer.load(Ordering::Acquire) == LastBufferUsed::None as u8 {
            self.spin.pause(&mut spins);
        }
        let which = LastBufferUsed::from_u8(control.consumer_buffer.load(Ordering::Acquire)).next();
        control.consumer_buffer.store(which as u8, Ordering::Release);
        let index = which.index();
        self.lock_when(index, true);
        self.claim(index, Holder::Consumer);
        let len = usize::try_from(control.sizes[index].load(Ordering::Acquire))
            .unwrap_or(self.buffer_size)
            .min(self.buffer_size);
        ConsumerBuffer {
            segment: self,
            index,
            len,
        }
    }

    fn data_ptr(&self, index: usize) -> *mut u8 {
        let offset = CONTROL_LEN + index * self.buffer_size.next_multiple_of(DATA_ALIGNMENT);
        // SAFETY: `new` checked the window holds both buffers past the control block.
        unsafe { self.window.as_mut_ptr().add(offset) }
    }

    /// Number of buffers currently full.
    pub fn full_count(&self) -> u32 {
        self.control().full_count.load(Ordering::Acquire)
    }

    pub fn holder(&self, which: LastBufferUsed) -> Holder {
        Holder::from_u8(self.control().holders[which.index()].load(Ordering::Acquire))
    }

    /// How often a buffer was claimed while someone else held it. Always zero unless the
    /// protocol is broken.
    pub fn exclusion_violations(&self) -> u32 {
        self.control().violations.load(Ordering::Acquire)
    }
}

/// A locked, empty buffer. Dropping it publishes the bytes written so far to the consumer.
pub struct ProducerBuffer<'a> {
    segment: &'a ShmSegment,
    index: usize,
    len: usize,
}

impl ProducerBuffer<'_> {
    pub fn capacity(&self) -> usize {
        self.segment.buffer_size
    }

    pub fn which(&self) -> LastBufferUsed {
        if self.index == 0 {
            LastBufferUsed::A
        } else {
            LastBufferUsed::B
        }
    }

    /// Copy as much of `data` as fits after the bytes already written, returning the count.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity() - self.len);
        // SAFETY: this buffer's spinlock is held for the lifetime of `self`, so no other
        // rank touches these bytes, and `len + n` stays within the buffer.
        let buffer = unsafe {
            std::slice::from_raw_parts_mut(self.segment.data_ptr(self.index), self.capacity())
        };
        buffer[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ProducerBuffer<'_> {
    fn drop(&mut self) {
        let control = self.segment.control();
        control.sizes[self.index].store(self.len as u64, Ordering::Release);
        control.full[self.index].store(true, Ordering::Release);
        control.full_count.fetch_add(1, Ordering::AcqRel);
        self.segment.release(self.index);
        self.segment.unlock(self.index);
    }
}

/// A locked, full buffer. Dropping it hands the buffer back to the producers.
pub struct ConsumerBuffer<'a> {
    segment: &'a ShmSegment,
    index: usize,
    len: usize,
}

impl ConsumerBuffer<'_> {
    pub fn which(&self) -> LastBufferUsed {
        if self.index == 0 {
            LastBufferUsed::A
        } else {
            LastBufferUsed::B
        }
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: this buffer's spinlock is held for the lifetime of `self` and the producer
        // published `len` bytes before releasing it.
        unsafe { std::slice::from_raw_parts(self.segment.data_ptr(self.index), self.len) }
    }
}

impl Drop for ConsumerBuffer<'_> {
    fn drop(&mut self) {
        let control = self.segment.control();
        control.sizes[self.index].store(0, Ordering::Release);
        control.full[self.index].store(false, Ordering::Release);
        control.full_count.fetch_sub(1, Ordering::AcqRel);
        self.segment.release(self.index);
        self.segment.unlock(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bp_comm::SharedWindow;

    use super::{Holder, LastBufferUsed, ShmSegment, SpinConfig};

    fn segment(buffer_size: usize) -> ShmSegment {
        let window = SharedWindow::anonymous(ShmSegment::required_len(buffer_size)).unwrap();
        ShmSegment::new(
            Arc::new(window),
            buffer_size,
            SpinConfig {
                spin_limit: 16,
                backoff: Duration::from_micros(1),
            },
        )
        .unwrap()
    }

    #[test]
    fn producer_alternates_buffers() {
        let seg = segment(8);
        let mut first = seg.lock_producer_buffer();
        assert_eq!(first.which(), LastBufferUsed::A);
        assert_eq!(seg.holder(LastBufferUsed::A), Holder::Producer);
        assert_eq!(first.fill(b"0123456789"), 8);
        drop(first);
        assert_eq!(seg.full_count(), 1);

        let second = seg.lock_producer_buffer();
        assert_eq!(second.which(), LastBufferUsed::B);
        drop(second);
        assert_eq!(seg.full_count(), 2);

        let consumed = seg.lock_consumer_buffer();
        assert_eq!(consumed.which(), LastBufferUsed::A);
        assert_eq!(consumed.data(), b"01234567");
        drop(consumed);
        let consumed = seg.lock_consumer_buffer();
        assert_eq!(consumed.which(), LastBufferUsed::B);
        assert!(consumed.data().is_empty());
        drop(consumed);
        assert_eq!(seg.full_count(), 0);
    }

    #[test]
    fn ping_pong_preserves_stream_and_exclusion() {
        let seg = segment(7);
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let received = std::thread::scope(|scope| {
            let producer = {
                let seg = seg.clone();
                let payload = &payload;
                scope.spawn(move || {
                    let mut sent = 0;
                    while sent < payload.len() {
                        let mut buffer = seg.lock_producer_buffer();
                        sent += buffer.fill(&payload[sent..]);
                        assert_ne!(seg.holder(buffer.which()), Holder::Consumer);
                    }
                })
            };

            let mut received = Vec::with_capacity(payload.len());
            while received.len() < payload.len() {
                let buffer = seg.lock_consumer_buffer();
                assert_eq!(seg.holder(buffer.which()), Holder::Consumer);
                received.extend_from_slice(buffer.data());
            }
            producer.join().unwrap();
            received
        });

        assert_eq!(received, payload);
        assert_eq!(seg.exclusion_violations(), 0);
        assert_eq!(seg.full_count(), 0);
    }

    #[test]
    fn rejects_small_windows() {
        let window = Arc::new(SharedWindow::anonymous(128).unwrap());
        assert!(ShmSegment::new(window, 4096, SpinConfig::default()).is_err());
    }
}
