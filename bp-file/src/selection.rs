use bp_error::{BpResult, bp_bail};

/// What part of a variable a `get` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The whole variable: the global shape of a global array, the value of a scalar.
    All,
    /// A box of a global array in global coordinates.
    BoundingBox { start: Vec<u64>, count: Vec<u64> },
    /// The `block`-th block written by `writer`, as written.
    Block { writer: usize, block: usize },
}

impl Selection {
    pub fn bounding_box(start: impl Into<Vec<u64>>, count: impl Into<Vec<u64>>) -> Self {
        Self::BoundingBox {
            start: start.into(),
            count: count.into(),
        }
    }

    pub fn block(writer: usize, block: usize) -> Self {
        Self::Block { writer, block }
    }
}

/// An axis-aligned box in row-major element coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoxRegion {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl BoxRegion {
    pub fn new(start: Vec<u64>, count: Vec<u64>) -> BpResult<Self> {
        if start.len() != count.len() {
            bp_bail!(
                InvalidArgument: "box start has {} dimensions, count has {}",
                start.len(),
                count.len()
            );
        }
        Ok(Self { start, count })
    }

    pub fn ndims(&self) -> usize {
        self.start.len()
    }

    pub fn elements(&self) -> u64 {
        self.count.iter().product()
    }

    pub fn end(&self, dim: usize) -> u64 {
        self.start[dim] + self.count[dim]
    }

    /// Whether `self` lies inside a global `shape`.
    pub fn fits_in(&self, shape: &[u64]) -> bool {
        shape.len() == self.ndims() && (0..self.ndims()).all(|d| self.end(d) <= shape[d])
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if self.ndims() != other.ndims() {
            return None;
        }
        let mut start = Vec::with_capacity(self.ndims());
        let mut count = Vec::with_capacity(self.ndims());
        for d in 0..self.ndims() {
            let lo = self.start[d].max(other.start[d]);
            let hi = self.end(d).min(other.end(d));
            if lo >= hi {
                return None;
            }
            start.push(lo);
            count.push(hi - lo);
        }
        Some(Self { start, count })
    }

    fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.ndims()];
        for d in (0..self.ndims().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.count[d + 1];
        }
        strides
    }

    /// Linear element offset of global point `point` within this box.
    fn offset_of(&self, point: &[u64], strides: &[u64]) -> u64 {
        point
            .iter()
            .zip(&self.start)
            .zip(strides)
            .map(|((p, s), stride)| (p - s) * stride)
            .sum()
    }
}

/// A contiguous byte copy from a block's raw payload into a destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRun {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

/// The copies moving the intersection of `block` and `request` from the block's row-major
/// payload to the request's row-major destination.
///
/// Trailing dimensions covered entirely by the intersection, the block and the request are
/// merged into a single run.
pub fn copy_runs(block: &BoxRegion, request: &BoxRegion, element_size: u64) -> Vec<CopyRun> {
    let Some(inter) = block.intersect(request) else {
        return Vec::new();
    };
    let ndims = inter.ndims();
    if ndims == 0 {
        return vec![CopyRun {
            src: 0,
            dst: 0,
            len: element_size,
        }];
    }

    let mut outer = ndims - 1;
    let mut run = inter.count[outer];
    while outer > 0
        && inter.count[outer] == block.count[outer]
        && inter.count[outer] == request.count[outer]
    {
        outer -= 1;
        run *= inter.count[outer];
    }

    let block_strides = block.strides();
    let request_strides = request.strides();
    let mut point = inter.start.clone();
    let mut runs = Vec::new();
    loop {
        runs.push(CopyRun {
            src: block.offset_of(&point, &block_strides) * element_size,
            dst: request.offset_of(&point, &request_strides) * element_size,
            len: run * element_size,
        });

        // Odometer over the dimensions in front of the run.
        let mut d = outer;
        loop {
            if d == 0 {
                return runs;
            }
            d -= 1;
            point[d] += 1;
            if point[d] < inter.end(d) {
                break;
            }
            point[d] = inter.start[d];
        }
    }
}
