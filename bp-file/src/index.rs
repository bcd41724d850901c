use std::ops::Range;

use bp_error::{BpResult, bp_bail, bp_err};

use crate::format::{Endianness, FormatBuffer, FormatReader};
use crate::header::{IndexHeader, Minifooter};
use crate::INDEX_HEADER_SIZE;

const U64: usize = size_of::<u64>();

/// Where one writer's payload for a step landed. Every flush but the last has a known size;
/// the final flush runs to the end of the writer's payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriterFlushes {
    /// `(DataPos, DataSize)` of every flush before the final one.
    pub flushes: Vec<(u64, u64)>,
    /// `DataPos` of the final flush.
    pub final_pos: u64,
}

impl WriterFlushes {
    pub fn single(pos: u64) -> Self {
        Self {
            flushes: Vec::new(),
            final_pos: pos,
        }
    }

    /// Logical payload ranges of every flush together with their physical start.
    fn segments(&self, payload_size: u64) -> BpResult<Vec<(Range<u64>, u64)>> {
        let mut segments = Vec::with_capacity(self.flushes.len() + 1);
        let mut logical = 0u64;
        for (pos, size) in &self.flushes {
            segments.push((logical..logical + size, *pos));
            logical += size;
        }
        if logical > payload_size {
            bp_bail!(
                IncompatibleFormat: "flushes hold {logical} bytes but the writer payload is {payload_size}"
            );
        }
        segments.push((logical..payload_size, self.final_pos));
        Ok(segments)
    }

    /// Translate a range of the writer's logical step payload into physical extents of its
    /// subfile, one per flush the range crosses.
    pub fn physical_extents(
        &self,
        logical: Range<u64>,
        payload_size: u64,
    ) -> BpResult<Vec<Range<u64>>> {
        if logical.end > payload_size {
            bp_bail!(
                OutOfBounds: logical.end as usize,
                0,
                payload_size as usize
            );
        }
        Ok(self
            .segments(payload_size)?
            .into_iter()
            .filter(|(segment, _)| segment.start < logical.end && logical.start < segment.end)
            .map(|(segment, pos)| {
                let start = logical.start.max(segment.start) - segment.start;
                let end = logical.end.min(segment.end) - segment.start;
                pos + start..pos + end
            })
            .collect())
    }
}

/// One step's entry in `md.idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub metadata_pos: u64,
    pub metadata_size: u64,
    /// Number of flushes of this step, the final one included.
    pub flush_count: u64,
    pub writers: Vec<WriterFlushes>,
}

impl StepRecord {
    /// Bytes of a record for `writer_count` writers, or `IncompatibleFormat` when `flush_count`
    /// is zero or the length does not fit in memory.
    pub fn encoded_len(writer_count: usize, flush_count: u64) -> BpResult<usize> {
        usize::try_from(flush_count)
            .ok()
            .and_then(|flushes| flushes.checked_mul(2))
            .and_then(|words| words.checked_sub(1))
            .and_then(|words| words.checked_mul(writer_count))
            .and_then(|words| words.checked_add(3))
            .and_then(|words| words.checked_mul(U64))
            .ok_or_else(|| {
                bp_err!(
                    IncompatibleFormat: "step record of {writer_count} writers with {flush_count} flushes has no valid length"
                )
            })
    }

    pub fn encode(&self, buffer: &mut FormatBuffer) -> BpResult<()> {
        buffer.put(self.metadata_pos);
        buffer.put(self.metadata_size);
        buffer.put(self.flush_count);
        for (writer, flushes) in self.writers.iter().enumerate() {
            if flushes.flushes.len() as u64 + 1 != self.flush_count {
                bp_bail!(
                    "writer {writer} recorded {} flushes, step has {}",
                    flushes.flushes.len() + 1,
                    self.flush_count
                );
            }
            for (pos, size) in &flushes.flushes {
                buffer.put(*pos);
                buffer.put(*size);
            }
            buffer.put(flushes.final_pos);
        }
        Ok(())
    }

    /// Decode the record at the start of `bytes`, or `None` if it is not complete yet.
    fn decode(
        bytes: &[u8],
        writer_count: usize,
        endianness: Endianness,
    ) -> BpResult<Option<(Self, usize)>> {
        if bytes.len() < 3 * U64 {
            return Ok(None);
        }
        let mut reader = FormatReader::new(bytes, endianness);
        let metadata_pos = reader.get::<u64>()?;
        let metadata_size = reader.get::<u64>()?;
        let flush_count = reader.get::<u64>()?;
        if flush_count == 0 {
            bp_bail!(IncompatibleFormat: "step record at metadata offset {metadata_pos} has no flushes");
        }
        let len = Self::encoded_len(writer_count, flush_count)?;
        if bytes.len() < len {
            return Ok(None);
        }

        let mut writers = Vec::with_capacity(writer_count);
        for _ in 0..writer_count {
            // `len` fits in `bytes`, so every writer's flush list does too.
            let mut flushes = Vec::with_capacity((flush_count - 1) as usize);
            for _ in 1..flush_count {
                flushes.push((reader.get::<u64>()?, reader.get::<u64>()?));
            }
            writers.push(WriterFlushes {
                flushes,
                final_pos: reader.get::<u64>()?,
            });
        }
        Ok(Some((
            Self {
                metadata_pos,
                metadata_size,
                flush_count,
                writers,
            },
            len,
        )))
    }

    /// Flush layout of `writer` at this step.
    pub fn writer(&self, writer: usize) -> BpResult<&WriterFlushes> {
        self.writers
            .get(writer)
            .ok_or_else(|| bp_err!(OutOfBounds: writer, 0, self.writers.len()))
    }
}

/// How a partially written trailing record is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailPolicy {
    /// Leave the cursor in front of the partial record and look again on the next poll.
    Retry,
    /// The dataset ends at the last complete record.
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Unopened,
    HeaderParsed,
    StepsInstalled(usize),
}

/// Incremental parser of `md.idx`.
///
/// The index may still be growing while it is read. Every call resumes from an internal
/// cursor, so handing the same bytes in twice never produces duplicate steps.
#[derive(Debug, Clone)]
pub struct MetadataIndex {
    tail_policy: TailPolicy,
    metadata_budget: Option<u64>,
    header: Option<IndexHeader>,
    minifooter: Option<Minifooter>,
    writer_map: Vec<usize>,
    steps: Vec<StepRecord>,
    cursor: u64,
    tail_closed: bool,
}

impl MetadataIndex {
    pub fn new(tail_policy: TailPolicy) -> Self {
        Self {
            tail_policy,
            metadata_budget: None,
            header: None,
            minifooter: None,
            writer_map: Vec::new(),
            steps: Vec::new(),
            cursor: 0,
            tail_closed: false,
        }
    }

    /// Stop a parse once the new steps reference more than `budget` bytes of metadata. The
    /// first new step is always accepted.
    pub fn with_metadata_budget(mut self, budget: u64) -> Self {
        self.metadata_budget = Some(budget);
        self
    }

    pub fn state(&self) -> IndexState {
        match (&self.header, self.steps.len()) {
            (None, _) => IndexState::Unopened,
            (Some(_), 0) => IndexState::HeaderParsed,
            (Some(_), n) => IndexState::StepsInstalled(n),
        }
    }

    /// Parse the header and the writer-to-subfile map from the start of the index.
    ///
    /// Returns `false` while `buffer` is too short to hold both.
    pub fn parse_index_header(&mut self, buffer: &[u8]) -> BpResult<bool> {
        if self.header.is_some() {
            return Ok(true);
        }
        if buffer.len() < INDEX_HEADER_SIZE {
            return Ok(false);
        }
        let header = IndexHeader::decode(buffer)?;
        let map_end = header.step_records_offset() as usize;
        if buffer.len() < map_end {
            return Ok(false);
        }

        let mut reader = FormatReader::new(buffer, header.endianness).at(INDEX_HEADER_SIZE);
        let mut writer_map = Vec::with_capacity(header.writer_count as usize);
        for writer in 0..header.writer_count {
            let subfile = reader.get::<u64>()?;
            if subfile >= u64::from(header.aggregator_count) {
                bp_bail!(
                    IncompatibleFormat: "writer {writer} maps to subfile {subfile} of {}",
                    header.aggregator_count
                );
            }
            writer_map.push(subfile as usize);
        }

        log::debug!(
            "index header: {} writers, {} subfiles, {}, writer {}",
            header.writer_count,
            header.aggregator_count,
            header.endianness,
            if header.writer_active { "active" } else { "closed" }
        );
        self.cursor = map_end as u64;
        self.minifooter = Some(Minifooter::from_header(&header));
        self.header = Some(header);
        self.writer_map = writer_map;
        Ok(true)
    }

    /// Parse step records from `buffer`, which holds index bytes starting at absolute offset
    /// `from_position`. Returns the number of new steps; 0 means "not yet".
    pub fn parse_step_records(
        &mut self,
        buffer: &[u8],
        from_position: u64,
        one_step_only: bool,
    ) -> BpResult<usize> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "step records parsed before the index header"))?;
        if self.tail_closed {
            return Ok(0);
        }
        if from_position > self.cursor {
            bp_bail!(
                InvalidArgument: "index bytes start at {from_position}, past the parse cursor {}",
                self.cursor
            );
        }
        let writer_count = header.writer_count as usize;
        let endianness = header.endianness;

        let mut offset = (self.cursor - from_position) as usize;
        let mut found = 0;
        let mut metadata = 0u64;
        while offset < buffer.len() {
            let Some((record, len)) = StepRecord::decode(&buffer[offset..], writer_count, endianness)?
            else {
                self.truncated_tail(buffer.len() - offset);
                break;
            };
            offset += len;
            self.cursor += len as u64;
            metadata = metadata.saturating_add(record.metadata_size);
            self.steps.push(record);
            found += 1;

            let over_budget = self.metadata_budget.is_some_and(|budget| metadata >= budget);
            if one_step_only || over_budget {
                break;
            }
        }
        Ok(found)
    }

    fn truncated_tail(&mut self, available: usize) {
        match self.tail_policy {
            TailPolicy::Retry => log::debug!(
                "partial step record ({available} bytes) at index offset {}, waiting for the writer",
                self.cursor
            ),
            TailPolicy::Truncate => {
                log::warn!(
                    "ignoring truncated step record ({available} bytes) at index offset {}",
                    self.cursor
                );
                self.tail_closed = true;
            }
        }
    }

    pub fn header(&self) -> BpResult<&IndexHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| bp_err!(InvalidArgument: "index header not parsed yet"))
    }

    pub fn minifooter(&self) -> Option<&Minifooter> {
        self.minifooter.as_ref()
    }

    pub fn writer_map(&self) -> &[usize] {
        &self.writer_map
    }

    pub fn subfile_of(&self, writer: usize) -> BpResult<usize> {
        self.writer_map
            .get(writer)
            .copied()
            .ok_or_else(|| bp_err!(OutOfBounds: writer, 0, self.writer_map.len()))
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, step: usize) -> BpResult<&StepRecord> {
        self.steps
            .get(step)
            .ok_or_else(|| bp_err!(OutOfBounds: step, 0, self.steps.len()))
    }

    /// Absolute index offset of the next unparsed record.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_tail_truncated(&self) -> bool {
        self.tail_closed
    }
}
