use std::ops::Range;
use std::sync::Arc;

use bp_error::{BpResult, bp_err};
use bp_io::{BpReadAt, TransportMan, merge_ranges};
use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use rayon::prelude::*;
use witchcraft_metrics::{Counter, MetricRegistry};

use crate::dtype::swap_elements;
use crate::operator::OperatorRegistry;
use crate::plan::{ReadRequest, SubFileInfoMap};

/// Counters of the selective read path.
#[derive(Clone)]
pub struct ReaderMetrics {
    requests: Arc<Counter>,
    reads: Arc<Counter>,
    bytes: Arc<Counter>,
    coalesced: Arc<Counter>,
}

impl ReaderMetrics {
    pub fn new(registry: &MetricRegistry) -> Self {
        Self {
            requests: registry.counter("bp.reader.requests"),
            reads: registry.counter("bp.reader.reads"),
            bytes: registry.counter("bp.reader.bytes"),
            coalesced: registry.counter("bp.reader.coalesced"),
        }
    }

    /// Read requests planned, one per intersecting block.
    pub fn requests(&self) -> i64 {
        self.requests.count()
    }

    /// Physical reads issued after coalescing.
    pub fn reads(&self) -> i64 {
        self.reads.count()
    }

    pub fn bytes(&self) -> i64 {
        self.bytes.count()
    }

    /// Extents folded into a neighbouring read.
    pub fn coalesced(&self) -> i64 {
        self.coalesced.count()
    }
}

/// Fetches the requests of a [`SubFileInfoMap`] and scatters them into destination buffers.
pub struct ReadExecutor<'a, T> {
    transports: &'a TransportMan<T>,
    operators: &'a OperatorRegistry,
    metrics: &'a ReaderMetrics,
    coalescing_window: u64,
}

impl<'a, T: BpReadAt> ReadExecutor<'a, T> {
    pub fn new(
        transports: &'a TransportMan<T>,
        operators: &'a OperatorRegistry,
        metrics: &'a ReaderMetrics,
        coalescing_window: u64,
    ) -> Self {
        Self {
            transports,
            operators,
            metrics,
            coalescing_window,
        }
    }

    /// Execute every request, writing get `i` into `dests[i]`.
    ///
    /// Subfiles are read in parallel; within one subfile, extents closer than the coalescing
    /// window share a physical read.
    pub fn execute(&self, map: &SubFileInfoMap, dests: &mut [Vec<u8>]) -> BpResult<()> {
        let by_subfile = map
            .values()
            .flat_map(|subfiles| subfiles.iter())
            .flat_map(|(subfile, steps)| steps.values().flatten().map(move |r| (*subfile, r)))
            .into_group_map();

        let fetched = by_subfile
            .into_par_iter()
            .map(|(subfile, requests)| self.fetch_subfile(subfile, requests))
            .collect::<BpResult<Vec<_>>>()?;

        for (request, bytes) in fetched.into_iter().flatten() {
            self.scatter(request, bytes, dests)?;
        }
        Ok(())
    }

    fn fetch_subfile<'r>(
        &self,
        subfile: usize,
        requests: Vec<&'r ReadRequest>,
    ) -> BpResult<Vec<(&'r ReadRequest, Bytes)>> {
        let ranges: Vec<Range<u64>> = requests
            .iter()
            .flat_map(|r| r.extents.iter().cloned())
            .collect();
        let physical = merge_ranges(ranges.clone(), self.coalescing_window).len();
        self.metrics.requests.add(requests.len() as i64);
        self.metrics.reads.add(physical as i64);
        self.metrics
            .coalesced
            .add(ranges.len().saturating_sub(physical) as i64);
        self.metrics
            .bytes
            .add(ranges.iter().map(|r| r.end - r.start).sum::<u64>() as i64);

        let mut pieces = self
            .transports
            .read_ranges(subfile, &ranges, self.coalescing_window)?
            .into_iter();

        let mut fetched = Vec::with_capacity(requests.len());
        for request in requests {
            let bytes = match request.extents.len() {
                1 => pieces.next(),
                n => {
                    let mut joined = BytesMut::with_capacity(request.len() as usize);
                    for piece in pieces.by_ref().take(n) {
                        joined.extend_from_slice(&piece);
                    }
                    Some(joined.freeze())
                }
            }
            .ok_or_else(|| bp_err!("subfile {subfile} returned fewer ranges than requested"))?;
            fetched.push((request, bytes));
        }
        Ok(fetched)
    }

    fn scatter(&self, request: &ReadRequest, bytes: Bytes, dests: &mut [Vec<u8>]) -> BpResult<()> {
        let raw = match &request.operation {
            Some(info) => Bytes::from(self.operators.get(&info.operator)?.get_data(&bytes, info)?),
            None => bytes,
        };
        let dest_len = dests.len();
        let dest = dests
            .get_mut(request.get)
            .ok_or_else(|| bp_err!(OutOfBounds: request.get, 0, dest_len))?;

        for copy in &request.copies {
            let (src, dst, len) = (copy.src as usize, copy.dst as usize, copy.len as usize);
            if src + len > raw.len() {
                return Err(bp_err!(OutOfBounds: src + len, 0, raw.len()));
            }
            if dst + len > dest.len() {
                return Err(bp_err!(OutOfBounds: dst + len, 0, dest.len()));
            }
            let target = &mut dest[dst..dst + len];
            target.copy_from_slice(&raw[src..src + len]);
            swap_elements(target, request.swap_width);
        }
        Ok(())
    }
}
