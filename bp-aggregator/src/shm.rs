use bp_comm::CommRef;
use bp_error::{BpResult, bp_err};

use crate::chain::handshake_links;
use crate::{AggregatorState, SpinConfig, ShmSegment, TOKEN_TAG, TokenChain, group_of};

const AGGREGATOR_CHAIN_TAG: bp_comm::Tag = TOKEN_TAG + 0x10;

/// Two-level aggregation: ranks are grouped per compute node, each group's consumer writes the
/// group's data, and producers hand their payload over through a shared-memory double buffer.
///
/// When there are more aggregators than subfiles, the aggregators of one subfile form an
/// aggregator chain whose first member (the master aggregator) creates the subfile.
#[derive(Debug)]
pub struct ShmChain {
    state: AggregatorState,
    node_comm: Option<CommRef>,
    comm: Option<CommRef>,
    all_aggregators: Option<CommRef>,
    aggregator_chain: Option<CommRef>,
    num_nodes: usize,
    num_aggregators: usize,
    segment: Option<ShmSegment>,
}

impl ShmChain {
    /// Build the node, group, aggregator and aggregator-chain communicators. Collective on
    /// `parent`.
    ///
    /// `num_aggregators == 0` means one aggregator per node, `sub_streams == 0` means one
    /// subfile per aggregator.
    pub fn init(num_aggregators: usize, sub_streams: usize, parent: &CommRef) -> BpResult<Self> {
        let node_comm = parent.group_by_shm()?;
        let node_rank = node_comm.rank();
        let node_size = node_comm.size();

        let one_per_node = parent.split((node_rank == 0).then_some(0), parent.rank())?;
        let nodes_here = one_per_node.as_ref().map(|c| c.size()).unwrap_or(0);
        let num_nodes = to_usize(node_comm.broadcast_value(nodes_here as u64, 0)?)?;

        let per_node = match num_aggregators {
            0 => 1,
            n => (n / num_nodes.max(1)).clamp(1, node_size),
        };
        let group = group_of(node_rank, node_size, per_node);
        let comm = node_comm
            .split(Some(to_u32(group)?), node_rank)?
            .ok_or_else(|| bp_err!(Comm: "aggregator group split returned no communicator"))?;
        let is_aggregator = comm.rank() == 0;
        let consumer_rank = to_usize(comm.broadcast_value(parent.rank() as u64, 0)?)?;

        let all_aggregators = parent.split(is_aggregator.then_some(0), parent.rank())?;
        let (agg_index, agg_count) = match &all_aggregators {
            Some(aggs) => (aggs.rank() as u64, aggs.size() as u64),
            None => (0, 0),
        };
        let agg_index = to_usize(comm.broadcast_value(agg_index, 0)?)?;
        let num_aggregators = to_usize(comm.broadcast_value(agg_count, 0)?)?;

        let sub_streams = match sub_streams {
            0 => num_aggregators,
            n => n.clamp(1, num_aggregators),
        };
        let sub_stream_index = group_of(agg_index, num_aggregators, sub_streams);

        let aggregator_chain = match &all_aggregators {
            Some(aggs) => aggs.split(Some(to_u32(sub_stream_index)?), agg_index)?,
            None => None,
        };
        let is_master = aggregator_chain.as_ref().map(|c| c.rank() == 0).unwrap_or(false);

        handshake_links(comm.as_ref())?;

        let state = AggregatorState {
            sub_streams,
            sub_stream_index,
            rank: comm.rank(),
            size: comm.size(),
            is_consumer: is_aggregator,
            is_master_aggregator: is_master,
            consumer_rank,
        };
        log::debug!(
            "rank {} on node {}/{num_nodes} in group of {} (consumer {consumer_rank}), subfile {sub_stream_index}/{sub_streams}",
            parent.rank(),
            node_rank,
            state.size,
        );

        Ok(Self {
            state,
            node_comm: Some(node_comm),
            comm: Some(comm),
            all_aggregators,
            aggregator_chain,
            num_nodes,
            num_aggregators,
            segment: None,
        })
    }

    /// Allocate the group's double buffer. Collective on the group; a group of one rank needs
    /// no buffer.
    pub fn create_shm(&mut self, buffer_size: usize, spin: SpinConfig) -> BpResult<()> {
        let comm = self.comm()?.clone();
        if comm.size() < 2 || self.segment.is_some() {
            return Ok(());
        }
        let window = comm.allocate_shared(ShmSegment::required_len(buffer_size))?;
        self.segment = Some(ShmSegment::new(window, buffer_size, spin)?);
        Ok(())
    }

    pub fn destroy_shm(&mut self) {
        self.segment = None;
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_aggregators(&self) -> usize {
        self.num_aggregators
    }

    /// The aggregator group communicator.
    pub fn comm(&self) -> BpResult<&CommRef> {
        self.comm
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "aggregator chain used after close"))
    }

    /// Communicator of the aggregators writing this rank's subfile. Only set on aggregators.
    pub fn aggregator_chain(&self) -> Option<&CommRef> {
        self.aggregator_chain.as_ref()
    }

    pub fn segment(&self) -> Option<&ShmSegment> {
        self.segment.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.comm.is_some()
    }

    /// Token chain over the aggregator group, fixing the order producers fill the buffer.
    pub fn token_chain(&self) -> BpResult<TokenChain<'_>> {
        Ok(TokenChain::new(self.comm()?.as_ref(), TOKEN_TAG))
    }

    /// Token chain over the aggregators of this subfile.
    pub fn aggregator_token_chain(&self) -> Option<TokenChain<'_>> {
        self.aggregator_chain
            .as_ref()
            .map(|c| TokenChain::new(c.as_ref(), AGGREGATOR_CHAIN_TAG))
    }

    /// Stream `data` to the consumer through the double buffer.
    pub fn produce(&self, data: &[u8]) -> BpResult<()> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "no shared-memory buffer to produce into"))?;
        let mut sent = 0;
        while sent < data.len() {
            let mut buffer = segment.lock_producer_buffer();
            sent += buffer.fill(&data[sent..]);
        }
        Ok(())
    }

    /// Drain `total` bytes from the double buffer, handing each buffer to `sink` in order.
    pub fn consume<F>(&self, total: u64, mut sink: F) -> BpResult<()>
    where
        F: FnMut(&[u8]) -> BpResult<()>,
    {
        if total == 0 {
            return Ok(());
        }
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "no shared-memory buffer to consume from"))?;
        let mut received = 0u64;
        while received < total {
            let buffer = segment.lock_consumer_buffer();
            let data = buffer.data();
            if data.is_empty() {
                return Err(bp_err!(
                    "producer published an empty buffer with {} bytes outstanding",
                    total - received
                ));
            }
            received += data.len() as u64;
            sink(data)?;
        }
        Ok(())
    }

    /// Release every communicator and the shared window. Safe to call more than once.
    pub fn close(&mut self) {
        if self.comm.is_none() {
            return;
        }
        self.destroy_shm();
        self.aggregator_chain = None;
        self.all_aggregators = None;
        self.comm = None;
        self.node_comm = None;
        log::debug!("closed shared-memory chain for subfile {}", self.state.sub_stream_index);
    }
}

fn to_usize(value: u64) -> BpResult<usize> {
    usize::try_from(value).map_err(|_| bp_err!(Comm: "value {value} does not fit in usize"))
}

fn to_u32(value: usize) -> BpResult<u32> {
    u32::try_from(value).map_err(|_| bp_err!(Comm: "color {value} does not fit in u32"))
}
