use std::fmt::Debug;
use std::sync::Arc;

use bp_error::{BpResult, bp_bail, bp_err};

use crate::SharedWindow;

/// Message tag. Tags at or above [`RESERVED_TAG_BASE`] belong to the collectives.
pub type Tag = u32;

pub const RESERVED_TAG_BASE: Tag = 0xFFFF_0000;
const BROADCAST_TAG: Tag = RESERVED_TAG_BASE;
const GATHER_TAG: Tag = RESERVED_TAG_BASE + 1;
const BARRIER_TAG: Tag = RESERVED_TAG_BASE + 2;
pub(crate) const SPLIT_TAG: Tag = RESERVED_TAG_BASE + 3;

/// A shared reference to a communicator.
pub type CommRef = Arc<dyn Communicator>;

/// A group of ranks that can exchange messages.
///
/// Point-to-point sends are buffered: [`Communicator::send`] returns once the message is
/// queued, never waiting for the matching receive. Messages between one pair of ranks with
/// one tag are delivered in order. Every provided collective must be called by all ranks of
/// the communicator in the same order.
pub trait Communicator: Send + Sync + Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Queue `data` for `dest`.
    fn send(&self, dest: usize, tag: Tag, data: &[u8]) -> BpResult<()>;

    /// Block until a message from `source` with `tag` arrives.
    fn recv(&self, source: usize, tag: Tag) -> BpResult<Vec<u8>>;

    /// Partition the communicator. Ranks passing the same `color` end up in the same new
    /// communicator, ordered by `key` then by their rank here. A `None` color opts out and
    /// yields `None`.
    fn split(&self, color: Option<u32>, key: usize) -> BpResult<Option<CommRef>>;

    /// Split into one communicator per shared-memory node.
    fn group_by_shm(&self) -> BpResult<CommRef>;

    /// Collectively allocate a zero-initialised shared-memory window of `bytes` bytes that
    /// every rank of this communicator maps.
    fn allocate_shared(&self, bytes: usize) -> BpResult<Arc<SharedWindow>>;

    /// Non-blocking send. Sends are buffered, so the request is complete on return.
    fn isend(&self, dest: usize, tag: Tag, data: &[u8]) -> BpResult<Request> {
        self.send(dest, tag, data)?;
        Ok(Request::Sent)
    }

    /// Post a receive to be completed with [`Communicator::wait`].
    fn irecv(&self, source: usize, tag: Tag) -> Request {
        Request::Recv { source, tag }
    }

    /// Complete a request, returning the received bytes for receives.
    fn wait(&self, request: Request) -> BpResult<Vec<u8>> {
        match request {
            Request::Sent => Ok(Vec::new()),
            Request::Recv { source, tag } => self.recv(source, tag),
        }
    }

    /// Complete every request, in order.
    fn wait_all(&self, requests: Vec<Request>) -> BpResult<Vec<Vec<u8>>> {
        requests.into_iter().map(|r| self.wait(r)).collect()
    }

    /// Replace `data` on every rank with the root's `data`.
    fn broadcast(&self, data: &mut Vec<u8>, root: usize) -> BpResult<()> {
        check_rank(root, self.size())?;
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send(dest, BROADCAST_TAG, data)?;
            }
        } else {
            *data = self.recv(root, BROADCAST_TAG)?;
        }
        Ok(())
    }

    /// Collect every rank's `data` on `root`, ordered by rank. Other ranks receive an empty list.
    fn gather(&self, data: &[u8], root: usize) -> BpResult<Vec<Vec<u8>>> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            self.send(root, GATHER_TAG, data)?;
            return Ok(Vec::new());
        }
        (0..self.size())
            .map(|source| {
                if source == root {
                    Ok(data.to_vec())
                } else {
                    self.recv(source, GATHER_TAG)
                }
            })
            .collect()
    }

    /// Collect every rank's `data` on every rank, ordered by rank.
    fn all_gather(&self, data: &[u8]) -> BpResult<Vec<Vec<u8>>> {
        let gathered = self.gather(data, 0)?;
        let mut packed = if self.rank() == 0 {
            pack(&gathered)
        } else {
            Vec::new()
        };
        self.broadcast(&mut packed, 0)?;
        unpack(&packed)
    }

    fn barrier(&self) -> BpResult<()> {
        if self.rank() == 0 {
            for source in 1..self.size() {
                self.recv(source, BARRIER_TAG)?;
            }
            for dest in 1..self.size() {
                self.send(dest, BARRIER_TAG, &[])?;
            }
        } else {
            self.send(0, BARRIER_TAG, &[])?;
            self.recv(0, BARRIER_TAG)?;
        }
        Ok(())
    }

    fn broadcast_value(&self, value: u64, root: usize) -> BpResult<u64> {
        let mut buffer = value.to_le_bytes().to_vec();
        self.broadcast(&mut buffer, root)?;
        decode_u64(&buffer)
    }

    /// Gather one value per rank on `root`; other ranks receive an empty list.
    fn gather_values(&self, value: u64, root: usize) -> BpResult<Vec<u64>> {
        self.gather(&value.to_le_bytes(), root)?
            .iter()
            .map(|bytes| decode_u64(bytes))
            .collect()
    }

    fn all_gather_values(&self, value: u64) -> BpResult<Vec<u64>> {
        self.all_gather(&value.to_le_bytes())?
            .iter()
            .map(|bytes| decode_u64(bytes))
            .collect()
    }

    fn send_value(&self, dest: usize, tag: Tag, value: u64) -> BpResult<()> {
        self.send(dest, tag, &value.to_le_bytes())
    }

    fn recv_value(&self, source: usize, tag: Tag) -> BpResult<u64> {
        decode_u64(&self.recv(source, tag)?)
    }
}

/// An outstanding point-to-point operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "requests must be completed with Communicator::wait"]
pub enum Request {
    Sent,
    Recv { source: usize, tag: Tag },
}

pub(crate) fn check_rank(rank: usize, size: usize) -> BpResult<()> {
    if rank >= size {
        bp_bail!(Comm: "rank {rank} out of range for communicator of size {size}");
    }
    Ok(())
}

pub(crate) fn decode_u64(bytes: &[u8]) -> BpResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| bp_err!(Comm: "expected an 8 byte value, received {} bytes", bytes.len()))?;
    Ok(u64::from_le_bytes(array))
}

/// Length-prefix and concatenate buffers.
pub(crate) fn pack(buffers: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = buffers.iter().map(|b| b.len() + 8).sum();
    let mut packed = Vec::with_capacity(total + 8);
    packed.extend_from_slice(&(buffers.len() as u64).to_le_bytes());
    for buffer in buffers {
        packed.extend_from_slice(&(buffer.len() as u64).to_le_bytes());
        packed.extend_from_slice(buffer);
    }
    packed
}

pub(crate) fn unpack(packed: &[u8]) -> BpResult<Vec<Vec<u8>>> {
    fn take<'a>(packed: &'a [u8], cursor: &mut usize, len: usize) -> BpResult<&'a [u8]> {
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= packed.len())
            .ok_or_else(|| bp_err!(Comm: "packed buffer truncated at {cursor}"))?;
        let slice = &packed[*cursor..end];
        *cursor = end;
        Ok(slice)
    }

    let mut cursor = 0usize;
    let count = usize::try_from(decode_u64(take(packed, &mut cursor, 8)?)?)
        .map_err(|_| bp_err!(Comm: "packed buffer count does not fit in memory"))?;
    let mut buffers = Vec::with_capacity(count);
    for _ in 0..count {
        let len = usize::try_from(decode_u64(take(packed, &mut cursor, 8)?)?)
            .map_err(|_| bp_err!(Comm: "packed buffer length does not fit in memory"))?;
        buffers.push(take(packed, &mut cursor, len)?.to_vec());
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::{pack, unpack};

    #[test]
    fn pack_unpack() {
        let buffers = vec![vec![1, 2, 3], vec![], vec![9]];
        assert_eq!(unpack(&pack(&buffers)).unwrap(), buffers);
        assert!(unpack(&pack(&buffers)[..10]).is_err());
    }
}
