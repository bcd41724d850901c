use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bp_error::{BpResult, bp_bail, bp_err};
use itertools::Itertools;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::comm::{SPLIT_TAG, check_rank, decode_u64};
use crate::{CommRef, Communicator, SharedWindow, Tag};

const NO_COLOR: u64 = u64::MAX;
const FAILED_WINDOW: u64 = u64::MAX;

struct Envelope {
    context: u64,
    source: usize,
    tag: Tag,
    payload: Vec<u8>,
}

impl Envelope {
    fn matches(&self, context: u64, source: usize, tag: Tag) -> bool {
        self.context == context && self.source == source && self.tag == tag
    }
}

struct Mailbox {
    tx: flume::Sender<Envelope>,
    rx: flume::Receiver<Envelope>,
    /// Messages that arrived before anyone asked for them.
    stash: Mutex<VecDeque<Envelope>>,
}

struct Hub {
    mailboxes: Vec<Mailbox>,
    next_context: AtomicU64,
    next_window: AtomicU64,
    windows: Mutex<FxHashMap<u64, Arc<SharedWindow>>>,
    ranks_per_node: usize,
    timeout: Duration,
}

/// A set of ranks living as threads of the current process.
#[derive(Debug, Clone)]
pub struct LocalWorld {
    size: usize,
    ranks_per_node: usize,
    timeout: Duration,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            ranks_per_node: usize::MAX,
            timeout: Duration::from_secs(120),
        }
    }

    /// Pretend the ranks are spread over nodes of `ranks_per_node` consecutive ranks, which
    /// drives [`Communicator::group_by_shm`].
    pub fn with_ranks_per_node(mut self, ranks_per_node: usize) -> Self {
        self.ranks_per_node = ranks_per_node.max(1);
        self
    }

    /// How long a receive may wait before failing. Turns a protocol deadlock into an error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One world communicator per rank.
    pub fn communicators(&self) -> Vec<LocalComm> {
        let mailboxes = (0..self.size)
            .map(|_| {
                let (tx, rx) = flume::unbounded();
                Mailbox {
                    tx,
                    rx,
                    stash: Mutex::new(VecDeque::new()),
                }
            })
            .collect();
        let hub = Arc::new(Hub {
            mailboxes,
            next_context: AtomicU64::new(1),
            next_window: AtomicU64::new(0),
            windows: Mutex::new(FxHashMap::default()),
            ranks_per_node: self.ranks_per_node,
            timeout: self.timeout,
        });
        let members: Arc<[usize]> = (0..self.size).collect();
        (0..self.size)
            .map(|rank| LocalComm {
                hub: hub.clone(),
                context: 0,
                members: members.clone(),
                rank,
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own named thread, and collect the results by rank.
    ///
    /// A panic on any rank is propagated once every thread has stopped.
    pub fn run<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(CommRef) -> R + Sync,
        R: Send,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles = self
                .communicators()
                .into_iter()
                .map(|comm| {
                    let rank = comm.rank();
                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(Arc::new(comm)))
                        .unwrap_or_else(|e| panic!("failed to spawn rank {rank}: {e}"))
                })
                .collect_vec();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    /// A single-rank world communicator.
    pub fn solo() -> CommRef {
        Arc::new(Self::new(1).communicators().remove(0))
    }
}

/// A communicator whose ranks are threads sharing one [`LocalWorld`].
pub struct LocalComm {
    hub: Arc<Hub>,
    context: u64,
    /// World ranks of this communicator's members, indexed by rank here.
    members: Arc<[usize]>,
    rank: usize,
}

impl Debug for LocalComm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .finish()
    }
}

impl LocalComm {
    /// This rank's index in the world communicator.
    pub fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    fn mailbox(&self) -> &Mailbox {
        &self.hub.mailboxes[self.world_rank()]
    }

    fn take_stashed(&self, source: usize, tag: Tag) -> Option<Vec<u8>> {
        let mut stash = self.mailbox().stash.lock();
        let position = stash
            .iter()
            .position(|e| e.matches(self.context, source, tag))?;
        stash.remove(position).map(|e| e.payload)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, tag: Tag, data: &[u8]) -> BpResult<()> {
        check_rank(dest, self.size())?;
        self.hub.mailboxes[self.members[dest]]
            .tx
            .send(Envelope {
                context: self.context,
                source: self.rank,
                tag,
                payload: data.to_vec(),
            })
            .map_err(|_| bp_err!(Comm: "rank {dest} is no longer receiving"))
    }

    fn recv(&self, source: usize, tag: Tag) -> BpResult<Vec<u8>> {
        check_rank(source, self.size())?;
        let deadline = Instant::now() + self.hub.timeout;
        loop {
            if let Some(payload) = self.take_stashed(source, tag) {
                return Ok(payload);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.mailbox().rx.recv_timeout(remaining) {
                Ok(envelope) if envelope.matches(self.context, source, tag) => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => self.mailbox().stash.lock().push_back(envelope),
                Err(flume::RecvTimeoutError::Timeout) => {
                    bp_bail!(Comm: "rank {} timed out waiting for tag {tag:#x} from rank {source}", self.rank)
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    bp_bail!(Comm: "world disconnected while rank {} waited for rank {source}", self.rank)
                }
            }
        }
    }

    fn split(&self, color: Option<u32>, key: usize) -> BpResult<Option<CommRef>> {
        let mut entry = Vec::with_capacity(16);
        entry.extend_from_slice(&color.map(u64::from).unwrap_or(NO_COLOR).to_le_bytes());
        entry.extend_from_slice(&(key as u64).to_le_bytes());
        let table = self
            .all_gather(&entry)?
            .iter()
            .map(|e| Ok((decode_u64(&e[..8])?, decode_u64(&e[8..])?)))
            .collect::<BpResult<Vec<_>>>()?;

        let Some(color) = color.map(u64::from) else {
            return Ok(None);
        };
        let group = table
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| *c == color)
            .sorted_by_key(|(rank, (_, k))| (*k, *rank))
            .map(|(rank, _)| rank)
            .collect_vec();
        let leader = group[0];
        let new_rank = group
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| bp_err!(Comm: "rank {} missing from its own split group", self.rank))?;

        let context = if self.rank == leader {
            let context = self.hub.next_context.fetch_add(1, Ordering::SeqCst);
            for &member in group.iter().skip(1) {
                self.send_value(member, SPLIT_TAG, context)?;
            }
            context
        } else {
            self.recv_value(leader, SPLIT_TAG)?
        };

        let members: Arc<[usize]> = group.iter().map(|&r| self.members[r]).collect();
        Ok(Some(Arc::new(LocalComm {
            hub: self.hub.clone(),
            context,
            members,
            rank: new_rank,
        })))
    }

    fn group_by_shm(&self) -> BpResult<CommRef> {
        let node = self.world_rank() / self.hub.ranks_per_node;
        let node = u32::try_from(node).map_err(|_| bp_err!(Comm: "node index {node} too large"))?;
        self.split(Some(node), self.rank)?
            .ok_or_else(|| bp_err!(Comm: "shared-memory split produced no communicator"))
    }

    fn allocate_shared(&self, bytes: usize) -> BpResult<Arc<SharedWindow>> {
        let mut id = FAILED_WINDOW;
        let mut local = None;
        if self.rank == 0 {
            match SharedWindow::anonymous(bytes) {
                Ok(window) => {
                    let window = Arc::new(window);
                    id = self.hub.next_window.fetch_add(1, Ordering::SeqCst);
                    self.hub.windows.lock().insert(id, window.clone());
                    local = Some(window);
                }
                Err(e) => log::error!("shared window allocation failed: {e}"),
            }
        }
        let id = self.broadcast_value(id, 0)?;
        if id == FAILED_WINDOW {
            bp_bail!(Comm: "rank 0 failed to allocate a {bytes} byte shared window");
        }
        let window = match local {
            Some(window) => window,
            None => self
                .hub
                .windows
                .lock()
                .get(&id)
                .cloned()
                .ok_or_else(|| bp_err!(Comm: "shared window {id} is not registered"))?,
        };
        self.barrier()?;
        if self.rank == 0 {
            self.hub.windows.lock().remove(&id);
        }
        Ok(window)
    }
}
