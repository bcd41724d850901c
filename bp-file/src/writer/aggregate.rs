use bp_aggregator::{AggregatorState, MpiChain, ShmChain};
use bp_comm::CommRef;
use bp_error::{BpResult, bp_err};
use bp_io::FileDrainer;

use crate::format::align_up;
use crate::params::{AggregationType, BpParams};
use crate::writer::output::{Output, Placement};

enum Chain {
    Everyone { chain: MpiChain, serial: bool },
    TwoLevel { chain: ShmChain },
}

/// Moves every rank's payload into its subfile, one collective call per flush.
pub(crate) struct DataWriter {
    chain: Chain,
    output: Option<Output>,
    page_size: u64,
    /// Next free position of the subfile. Kept by the rank that starts the position chain.
    next_pos: u64,
}

impl DataWriter {
    /// Build the aggregation chain and open this rank's subfile. Collective on `comm`.
    pub(crate) fn open(comm: &CommRef, params: &BpParams, placement: &Placement) -> BpResult<Self> {
        let (chain, output) = match params.aggregation_type {
            AggregationType::EveryoneWrites | AggregationType::EveryoneWritesSerial => {
                let groups = match (params.num_sub_files, params.num_aggregators) {
                    (0, 0) => comm.size(),
                    (0, aggregators) => aggregators,
                    (sub_files, _) => sub_files,
                };
                let chain = MpiChain::init(groups, comm)?;
                let subfile = chain.state().sub_stream_index;
                let group = chain.comm()?.clone();

                let created = (group.rank() == 0)
                    .then(|| placement.create(|p| p.data(subfile)))
                    .transpose()?;
                group.barrier()?;
                let output = match created {
                    Some(output) => output,
                    None => placement.open(|p| p.data(subfile))?,
                };
                let serial = params.aggregation_type == AggregationType::EveryoneWritesSerial;
                (Chain::Everyone { chain, serial }, Some(output))
            }
            AggregationType::TwoLevelShm => {
                let mut chain = ShmChain::init(params.num_aggregators, params.num_sub_files, comm)?;
                chain.create_shm(params.max_shm_size, params.spin_config())?;
                let state = *chain.state();
                let subfile = state.sub_stream_index;

                let output = if state.is_consumer {
                    let created = state
                        .is_master_aggregator
                        .then(|| placement.create(|p| p.data(subfile)))
                        .transpose()?;
                    if let Some(aggregators) = chain.aggregator_chain() {
                        aggregators.barrier()?;
                    }
                    match created {
                        Some(output) => Some(output),
                        None => Some(placement.open(|p| p.data(subfile))?),
                    }
                } else {
                    None
                };
                (Chain::TwoLevel { chain }, output)
            }
        };

        Ok(Self {
            chain,
            output,
            page_size: params.file_system_page_size,
            next_pos: 0,
        })
    }

    pub(crate) fn state(&self) -> &AggregatorState {
        match &self.chain {
            Chain::Everyone { chain, .. } => chain.state(),
            Chain::TwoLevel { chain } => chain.state(),
        }
    }

    pub(crate) fn subfile(&self) -> usize {
        self.state().sub_stream_index
    }

    pub(crate) fn sub_streams(&self) -> usize {
        self.state().sub_streams
    }

    /// Write this rank's `data` and return where in the subfile it starts. Collective on the
    /// parent communicator.
    pub(crate) fn write(&mut self, data: &[u8], drainer: Option<&FileDrainer>) -> BpResult<u64> {
        let Self {
            chain,
            output,
            page_size,
            next_pos,
        } = self;
        let len = data.len() as u64;

        match chain {
            Chain::Everyone { chain, serial } => {
                let output = output
                    .as_ref()
                    .ok_or_else(|| bp_err!("writer rank has no subfile open"))?;
                let tokens = chain.token_chain()?;
                let pos = align_up(tokens.recv_from_previous(*next_pos)?, *page_size);
                if !*serial {
                    tokens.send_to_next(pos + len)?;
                }
                output.write_at(data, pos, drainer)?;
                if *serial {
                    tokens.send_to_next(pos + len)?;
                }
                *next_pos = tokens.recv_from_last(pos + len)?;
                Ok(pos)
            }
            Chain::TwoLevel { chain } => {
                let comm = chain.comm()?.clone();
                let sizes = comm.all_gather_values(len)?;
                let total: u64 = sizes.iter().sum();
                let is_consumer = chain.state().is_consumer;

                let mut group_start = 0;
                if is_consumer {
                    group_start = match chain.aggregator_token_chain() {
                        Some(tokens) => {
                            let pos = align_up(tokens.recv_from_previous(*next_pos)?, *page_size);
                            tokens.send_to_next(pos + total)?;
                            *next_pos = tokens.recv_from_last(pos + total)?;
                            pos
                        }
                        None => {
                            let pos = align_up(*next_pos, *page_size);
                            *next_pos = pos + total;
                            pos
                        }
                    };
                }
                let group_start = comm.broadcast_value(group_start, 0)?;
                let pos = group_start + sizes[..comm.rank()].iter().sum::<u64>();

                if is_consumer {
                    let output = output
                        .as_ref()
                        .ok_or_else(|| bp_err!("consumer rank has no subfile open"))?;
                    let tokens = chain.token_chain()?;
                    tokens.send_to_next(0)?;
                    output.write_at(data, pos, drainer)?;
                    let mut cursor = pos + len;
                    chain.consume(total - len, |chunk| {
                        output.write_at(chunk, cursor, drainer)?;
                        cursor += chunk.len() as u64;
                        Ok(())
                    })?;
                    tokens.recv_from_last(0)?;
                } else {
                    let tokens = chain.token_chain()?;
                    let token = tokens.recv_from_previous(0)?;
                    chain.produce(data)?;
                    tokens.send_to_next(token)?;
                }
                Ok(pos)
            }
        }
    }

    pub(crate) fn flush(&self) -> BpResult<()> {
        match &self.output {
            Some(output) => output.flush(),
            None => Ok(()),
        }
    }

    pub(crate) fn close(&mut self) {
        match &mut self.chain {
            Chain::Everyone { chain, .. } => chain.close(),
            Chain::TwoLevel { chain } => chain.close(),
        }
        self.output = None;
    }
}
