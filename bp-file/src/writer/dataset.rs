use bp_error::{BpResult, bp_bail};
use bp_io::FileDrainer;
use serde::{Deserialize, Serialize};

use crate::format::FormatBuffer;
use crate::header::{FileKind, IndexHeader, encode_writer_map};
use crate::index::{StepRecord, WriterFlushes};
use crate::metadata::{MetaMetadataLog, decode_meta_meta_records, encode_combined_metadata};
use crate::writer::output::{Output, Placement};
use crate::{ACTIVE_FLAG_POSITION, INDEX_HEADER_SIZE};

/// What one writer hands to rank 0 at the end of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StepContribution {
    /// `(pos, size)` of every flush before the final one.
    pub(crate) flushes: Vec<(u64, u64)>,
    pub(crate) final_pos: u64,
    /// Encoded [`crate::schema::WriterMetadata`], empty if the writer put nothing.
    pub(crate) metadata: Vec<u8>,
    /// Encoded [`crate::schema::AttributeBlock`], empty if unchanged.
    pub(crate) attributes: Vec<u8>,
    /// `mmd.0` records this writer has not sent before.
    pub(crate) meta_metadata: Vec<u8>,
}

impl StepContribution {
    pub(crate) fn encode(&self) -> BpResult<Vec<u8>> {
        Ok(flexbuffers::to_vec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> BpResult<Self> {
        Ok(flexbuffers::from_slice(bytes)?)
    }
}

/// The index, metadata and meta-metadata files, owned by rank 0.
pub(crate) struct DatasetFiles {
    header: IndexHeader,
    index: Output,
    index_end: u64,
    metadata: Output,
    metadata_end: u64,
    meta_metadata: Output,
    meta_metadata_end: u64,
    formats: MetaMetadataLog,
}

impl DatasetFiles {
    /// Create the three files. The index is written last, so a reader that finds it also
    /// finds the others.
    pub(crate) fn create(
        placement: &Placement,
        header: IndexHeader,
        writer_map: &[u64],
        drainer: Option<&FileDrainer>,
    ) -> BpResult<Self> {
        let metadata = placement.create(|p| p.metadata())?;
        let metadata_header = IndexHeader {
            writer_active: false,
            ..header.clone()
        }
        .encode(FileKind::Metadata);
        metadata.write_at(&metadata_header, 0, drainer)?;

        let meta_metadata = placement.create(|p| p.meta_metadata())?;

        let index = placement.create(|p| p.index())?;
        let mut prefix = header.encode(FileKind::Index);
        prefix.extend_from_slice(&encode_writer_map(writer_map, header.endianness));
        index.write_at(&prefix, 0, drainer)?;

        Ok(Self {
            index_end: prefix.len() as u64,
            metadata_end: INDEX_HEADER_SIZE as u64,
            meta_metadata_end: 0,
            header,
            index,
            metadata,
            meta_metadata,
            formats: MetaMetadataLog::default(),
        })
    }

    /// Append one step: new format descriptors, the combined metadata block, then the index
    /// record that makes the step visible.
    pub(crate) fn append_step(
        &mut self,
        contributions: Vec<StepContribution>,
        drainer: Option<&FileDrainer>,
    ) -> BpResult<StepRecord> {
        let endianness = self.header.endianness;
        if contributions.len() != self.header.writer_count as usize {
            bp_bail!(
                "{} step contributions for {} writers",
                contributions.len(),
                self.header.writer_count
            );
        }

        let mut records = Vec::new();
        for contribution in &contributions {
            let (decoded, _) = decode_meta_meta_records(&contribution.meta_metadata, endianness)?;
            records.extend(decoded);
        }
        let new_formats = self.formats.append_new(records, endianness)?;
        self.meta_metadata
            .write_at(&new_formats, self.meta_metadata_end, drainer)?;
        self.meta_metadata_end += new_formats.len() as u64;

        let flush_count = contributions
            .first()
            .map_or(1, |c| c.flushes.len() as u64 + 1);
        let mut metadata = Vec::with_capacity(contributions.len());
        let mut attributes = Vec::with_capacity(contributions.len());
        let mut writers = Vec::with_capacity(contributions.len());
        for contribution in contributions {
            metadata.push(contribution.metadata);
            attributes.push(contribution.attributes);
            writers.push(WriterFlushes {
                flushes: contribution.flushes,
                final_pos: contribution.final_pos,
            });
        }

        let block = encode_combined_metadata(&metadata, &attributes, endianness)?;
        let record = StepRecord {
            metadata_pos: self.metadata_end,
            metadata_size: block.len() as u64,
            flush_count,
            writers,
        };
        let mut encoded = FormatBuffer::with_capacity(
            endianness,
            StepRecord::encoded_len(record.writers.len(), flush_count)?,
        );
        record.encode(&mut encoded)?;

        self.metadata.write_at(&block, self.metadata_end, drainer)?;
        self.metadata_end += block.len() as u64;
        self.metadata.flush()?;

        self.index
            .write_at(encoded.as_slice(), self.index_end, drainer)?;
        self.index_end += encoded.len() as u64;
        Ok(record)
    }

    /// Clear the writer-active flag of the index header.
    pub(crate) fn close(&mut self, drainer: Option<&FileDrainer>) -> BpResult<()> {
        self.index
            .write_at(&[0u8], ACTIVE_FLAG_POSITION as u64, drainer)?;
        self.index.flush()?;
        self.metadata.flush()?;
        self.meta_metadata.flush()
    }
}
