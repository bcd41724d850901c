//! Aggregation chains bound the number of subfiles a job writes.
//!
//! Every writer rank is assigned to a group; the group's first rank is the consumer and owns
//! the group's share of a subfile. [`MpiChain`] groups contiguous ranks of the parent
//! communicator, [`ShmChain`] first splits by compute node and lets producers stream their
//! payload to the consumer through a [`ShmSegment`] double buffer.

pub use chain::*;
pub use partition::*;
pub use segment::*;
pub use shm::*;

mod chain;
mod partition;
mod segment;
mod shm;

use bp_comm::Tag;

pub(crate) const HANDSHAKE_LINK_TAG: Tag = 0x4100;
pub(crate) const TOKEN_TAG: Tag = 0x4101;

/// The role of one rank in its aggregator group, fixed at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorState {
    /// Number of subfiles the job writes.
    pub sub_streams: usize,
    /// The subfile this rank's data lands in.
    pub sub_stream_index: usize,
    /// Rank within the aggregator group.
    pub rank: usize,
    /// Size of the aggregator group.
    pub size: usize,
    /// Whether this rank writes the group's data to a transport.
    pub is_consumer: bool,
    /// Whether this rank is the first aggregator of its subfile, the one that creates it.
    pub is_master_aggregator: bool,
    /// Parent-communicator rank of the group's consumer.
    pub consumer_rank: usize,
}
