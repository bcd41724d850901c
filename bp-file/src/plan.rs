//! Turning a `get` into byte-range reads.
//!
//! Every on-disk block that intersects the selection yields one [`ReadRequest`]: the span of
//! the writer's payload holding the intersection, its physical extents in the writer's subfile
//! and the copies that move it into the destination. Requests are grouped per subfile in a
//! [`SubFileInfoMap`] so the executor can coalesce and parallelise I/O.

use std::collections::BTreeMap;
use std::ops::Range;

use bp_error::{BpResult, bp_bail, bp_err};

use crate::deserializer::{BlockInfo, StepVariables, VarInfo};
use crate::dtype::DataType;
use crate::index::{MetadataIndex, StepRecord};
use crate::operator::BlockOperationInfo;
use crate::schema::ShapeKind;
use crate::selection::{BoxRegion, CopyRun, Selection, copy_runs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Index of the pending get this request fills.
    pub get: usize,
    pub step: usize,
    pub writer: usize,
    pub subfile: usize,
    /// Range of the writer's logical step payload to fetch.
    pub payload: Range<u64>,
    /// Physical ranges of the subfile that concatenate to `payload`.
    pub extents: Vec<Range<u64>>,
    /// Copies from the fetched (and, for encoded blocks, decoded) bytes into the destination.
    pub copies: Vec<CopyRun>,
    pub operation: Option<BlockOperationInfo>,
    /// Element width to byte-swap while copying, or 0 to copy as is.
    pub swap_width: usize,
}

impl ReadRequest {
    pub fn len(&self) -> u64 {
        self.payload.end - self.payload.start
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The reads of one `get`, with the shape of its destination.
#[derive(Debug, Clone)]
pub struct PlannedGet {
    pub variable: String,
    pub step: usize,
    pub dtype: DataType,
    pub count: Vec<u64>,
    pub requests: Vec<ReadRequest>,
}

impl PlannedGet {
    pub fn dest_len(&self) -> usize {
        self.count.iter().product::<u64>() as usize * self.dtype.byte_width()
    }
}

/// Variable name → subfile → step → requests.
pub type SubFileInfoMap = BTreeMap<String, BTreeMap<usize, BTreeMap<usize, Vec<ReadRequest>>>>;

/// Everything the planner needs to know about one installed step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub step: usize,
    pub variables: &'a StepVariables,
    pub record: &'a StepRecord,
    pub index: &'a MetadataIndex,
    /// Whether the dataset was written in the other byte order.
    pub swap_bytes: bool,
}

/// Plan get number `get` of `selection` on `variable` at one step.
pub fn plan_get(
    get: usize,
    variable: &str,
    selection: &Selection,
    ctx: StepContext<'_>,
) -> BpResult<PlannedGet> {
    let var = ctx.variables.variable(variable)?;
    let element_size = var.dtype.byte_width() as u64;
    let (request, candidates) = resolve_selection(var, selection)?;

    let mut requests = Vec::new();
    for block in candidates {
        let block_region = block_region(block);
        let copies = copy_runs(&block_region, &request, element_size);
        if copies.is_empty() {
            continue;
        }
        requests.push(plan_block(get, block, copies, element_size, var.dtype, ctx)?);
    }

    log::debug!(
        "get {get} of {variable} at step {}: {} requests for {} elements",
        ctx.step,
        requests.len(),
        request.elements()
    );
    Ok(PlannedGet {
        variable: variable.to_string(),
        step: ctx.step,
        dtype: var.dtype,
        count: request.count,
        requests,
    })
}

/// The destination box and the blocks that may contribute to it.
fn resolve_selection<'a>(
    var: &'a VarInfo,
    selection: &Selection,
) -> BpResult<(BoxRegion, Vec<&'a BlockInfo>)> {
    match selection {
        Selection::Block { writer, block } => {
            let block = var.block(*writer, *block)?;
            Ok((block_region(block), vec![block]))
        }
        Selection::BoundingBox { start, count } => {
            if var.shape_kind != ShapeKind::GlobalArray {
                bp_bail!(
                    InvalidArgument: "{} is a {:?}, a bounding box needs a global array",
                    var.name,
                    var.shape_kind
                );
            }
            let request = BoxRegion::new(start.clone(), count.clone())?;
            if !request.fits_in(&var.shape) {
                bp_bail!(
                    InvalidArgument: "selection {start:?}+{count:?} outside {} of shape {:?}",
                    var.name,
                    var.shape
                );
            }
            Ok((request, var.blocks.iter().collect()))
        }
        Selection::All => match var.shape_kind {
            ShapeKind::GlobalArray => Ok((
                BoxRegion::new(vec![0; var.shape.len()], var.shape.clone())?,
                var.blocks.iter().collect(),
            )),
            ShapeKind::GlobalValue | ShapeKind::LocalValue => {
                let first = var
                    .blocks
                    .first()
                    .ok_or_else(|| bp_err!(NotFound: "no value written for {}", var.name))?;
                Ok((block_region(first), vec![first]))
            }
            ShapeKind::LocalArray => Err(bp_err!(
                InvalidArgument: "{} is a local array, select one block of it",
                var.name
            )),
        },
    }
}

/// A block's box; local blocks have no global start and are placed at the origin.
fn block_region(block: &BlockInfo) -> BoxRegion {
    let start = if block.start.len() == block.count.len() {
        block.start.clone()
    } else {
        vec![0; block.count.len()]
    };
    BoxRegion {
        start,
        count: block.count.clone(),
    }
}

fn plan_block(
    get: usize,
    block: &BlockInfo,
    mut copies: Vec<CopyRun>,
    element_size: u64,
    dtype: DataType,
    ctx: StepContext<'_>,
) -> BpResult<ReadRequest> {
    let payload = match &block.operation {
        // Encoded blocks are fetched and decoded whole; copies address the decoded block.
        Some(_) => block.payload_offset..block.payload_offset + block.payload_size,
        None => {
            let first = copies.iter().map(|c| c.src).min().unwrap_or(0);
            let last = copies.iter().map(|c| c.src + c.len).max().unwrap_or(0);
            if last > block.payload_size {
                bp_bail!(
                    IncompatibleFormat: "block of {} elements needs {last} bytes, {} stored",
                    block.element_count(),
                    block.payload_size
                );
            }
            for copy in &mut copies {
                copy.src -= first;
            }
            block.payload_offset + first..block.payload_offset + last
        }
    };

    let data_size = ctx.variables.data_size(block.writer)?;
    let extents = ctx
        .record
        .writer(block.writer)?
        .physical_extents(payload.clone(), data_size)?;

    Ok(ReadRequest {
        get,
        step: ctx.step,
        writer: block.writer,
        subfile: ctx.index.subfile_of(block.writer)?,
        payload,
        extents,
        copies,
        operation: block.operation.clone(),
        swap_width: if ctx.swap_bytes && element_size > 1 {
            dtype.byte_width()
        } else {
            0
        },
    })
}

/// Group the requests of `gets` by variable, subfile and step.
pub fn group_by_subfile(gets: &[PlannedGet]) -> SubFileInfoMap {
    let mut map = SubFileInfoMap::new();
    for get in gets {
        for request in &get.requests {
            map.entry(get.variable.clone())
                .or_default()
                .entry(request.subfile)
                .or_default()
                .entry(request.step)
                .or_default()
                .push(request.clone());
        }
    }
    map
}
