use bp_comm::{CommRef, Communicator, Tag};
use bp_error::{BpResult, bp_err};

use crate::{AggregatorState, HANDSHAKE_LINK_TAG, TOKEN_TAG, group_of};

/// Groups contiguous ranks of the parent communicator, one group per subfile.
///
/// Group rank 0 is the consumer. Each group is linked as a chain so a value (typically the
/// next write offset) can be relayed rank by rank.
#[derive(Debug)]
pub struct MpiChain {
    state: AggregatorState,
    comm: Option<CommRef>,
}

impl MpiChain {
    /// InitComm, HandshakeRank and HandshakeLinks over `parent`. Collective on `parent`.
    pub fn init(sub_streams: usize, parent: &CommRef) -> BpResult<Self> {
        let mut chain = Self::init_comm(sub_streams, parent)?;
        chain.handshake_rank(parent.rank())?;
        chain.handshake_links()?;
        log::debug!(
            "rank {} joined chain {} of {} as rank {}/{}",
            parent.rank(),
            chain.state.sub_stream_index,
            chain.state.sub_streams,
            chain.state.rank,
            chain.state.size
        );
        Ok(chain)
    }

    /// Partition `parent` into `sub_streams` contiguous groups and split off this rank's group.
    pub fn init_comm(sub_streams: usize, parent: &CommRef) -> BpResult<Self> {
        let processes = parent.size();
        let sub_streams = sub_streams.clamp(1, processes);
        let group = group_of(parent.rank(), processes, sub_streams);
        let color = u32::try_from(group).map_err(|_| bp_err!(Comm: "group {group} too large"))?;
        let comm = parent
            .split(Some(color), parent.rank())?
            .ok_or_else(|| bp_err!(Comm: "aggregator split returned no communicator"))?;
        let rank = comm.rank();
        Ok(Self {
            state: AggregatorState {
                sub_streams,
                sub_stream_index: group,
                rank,
                size: comm.size(),
                is_consumer: rank == 0,
                is_master_aggregator: rank == 0,
                consumer_rank: 0,
            },
            comm: Some(comm),
        })
    }

    /// The consumer tells the group its parent rank.
    pub fn handshake_rank(&mut self, parent_rank: usize) -> BpResult<usize> {
        let comm = self.comm()?;
        let consumer = comm.broadcast_value(parent_rank as u64, 0)?;
        let consumer = usize::try_from(consumer)
            .map_err(|_| bp_err!(Comm: "consumer rank {consumer} does not fit in usize"))?;
        self.state.consumer_rank = consumer;
        Ok(consumer)
    }

    /// Pair every rank with its neighbours: send to `rank - 1`, receive from `rank + 1`.
    pub fn handshake_links(&self) -> BpResult<()> {
        handshake_links(self.comm()?.as_ref())
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    /// The group communicator, failing once the chain is closed.
    pub fn comm(&self) -> BpResult<&CommRef> {
        self.comm
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "aggregator chain used after close"))
    }

    pub fn is_active(&self) -> bool {
        self.comm.is_some()
    }

    pub fn token_chain(&self) -> BpResult<TokenChain<'_>> {
        Ok(TokenChain::new(self.comm()?.as_ref(), TOKEN_TAG))
    }

    /// Release the group communicator. Safe to call more than once.
    pub fn close(&mut self) {
        if self.comm.take().is_some() {
            log::debug!("closed aggregator chain {}", self.state.sub_stream_index);
        }
    }
}

pub(crate) fn handshake_links(comm: &dyn Communicator) -> BpResult<()> {
    let rank = comm.rank();
    let mut requests = Vec::with_capacity(2);
    if rank > 0 {
        requests.push(comm.isend(rank - 1, HANDSHAKE_LINK_TAG, &(rank as u64).to_le_bytes())?);
    }
    if rank + 1 < comm.size() {
        requests.push(comm.irecv(rank + 1, HANDSHAKE_LINK_TAG));
    }
    for reply in comm.wait_all(requests)? {
        if !reply.is_empty() && reply != ((rank + 1) as u64).to_le_bytes() {
            return Err(bp_err!(Comm: "rank {rank} received a mismatched link handshake"));
        }
    }
    Ok(())
}

/// Passes a single `u64` along the ranks of a communicator in rank order.
///
/// Rank 0 starts the chain, every other rank waits for its predecessor, and the last rank
/// hands the token back to rank 0.
#[derive(Debug)]
pub struct TokenChain<'a> {
    comm: &'a dyn Communicator,
    tag: Tag,
}

impl<'a> TokenChain<'a> {
    pub fn new(comm: &'a dyn Communicator, tag: Tag) -> Self {
        Self { comm, tag }
    }

    /// Wait for the predecessor's token. Rank 0 gets `start` back immediately.
    pub fn recv_from_previous(&self, start: u64) -> BpResult<u64> {
        match self.comm.rank() {
            0 => Ok(start),
            rank => self.comm.recv_value(rank - 1, self.tag),
        }
    }

    /// Forward a token to the next rank; the last rank returns it to rank 0.
    pub fn send_to_next(&self, token: u64) -> BpResult<()> {
        let size = self.comm.size();
        if size == 1 {
            return Ok(());
        }
        let next = (self.comm.rank() + 1) % size;
        self.comm.send_value(next, self.tag, token)
    }

    /// On rank 0, wait for the token to come back from the last rank.
    pub fn recv_from_last(&self, fallback: u64) -> BpResult<u64> {
        let size = self.comm.size();
        if self.comm.rank() != 0 || size == 1 {
            return Ok(fallback);
        }
        self.comm.recv_value(size - 1, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use bp_comm::LocalWorld;
    use rstest::rstest;

    use crate::{MpiChain, partition};

    #[rstest]
    #[case(4, 2)]
    #[case(5, 2)]
    #[case(7, 3)]
    #[case(3, 3)]
    #[case(2, 1)]
    fn chain_matches_partition(#[case] processes: usize, #[case] sub_streams: usize) {
        let states = LocalWorld::new(processes).run(|comm| {
            let mut chain = MpiChain::init(sub_streams, &comm).unwrap();
            let state = *chain.state();
            chain.close();
            chain.close();
            assert!(!chain.is_active());
            state
        });
        let groups = partition(processes, sub_streams);
        for (rank, state) in states.iter().enumerate() {
            let group = &groups[state.sub_stream_index];
            assert!(group.contains(&rank));
            assert_eq!(state.rank, rank - group.start);
            assert_eq!(state.size, group.len());
            assert_eq!(state.consumer_rank, group.start);
            assert_eq!(state.is_consumer, rank == group.start);
            assert_eq!(state.sub_streams, sub_streams);
        }
    }

    #[test]
    fn token_walks_the_chain() {
        let tokens = LocalWorld::new(4).run(|comm| {
            let chain = MpiChain::init(1, &comm).unwrap();
            let tokens = chain.token_chain().unwrap();
            let start = tokens.recv_from_previous(10).unwrap();
            tokens.send_to_next(start + 5).unwrap();
            let end = tokens.recv_from_last(start + 5).unwrap();
            (start, end)
        });
        assert_eq!(tokens, vec![(10, 30), (15, 20), (20, 25), (25, 30)]);
    }
}
