//! Codecs for the combined per-step metadata block of `md.0` and the meta-metadata records of
//! `mmd.0`.

use bp_error::{BpResult, bp_bail, bp_err};
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::format::{Endianness, FormatBuffer, FormatReader};
use crate::schema::{FormatDescriptor, FormatId};

const U64: usize = size_of::<u64>();

/// One writer's share of a combined metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterMetadataSlices {
    pub metadata: Bytes,
    /// Empty when the writer's attributes did not change this step.
    pub attributes: Bytes,
}

/// Assemble `TotalSize, MetaLen × W, AttrLen × W, metadata blocks, attribute blocks`.
pub fn encode_combined_metadata(
    metadata: &[Vec<u8>],
    attributes: &[Vec<u8>],
    endianness: Endianness,
) -> BpResult<Vec<u8>> {
    if metadata.len() != attributes.len() {
        bp_bail!(
            "{} metadata blocks but {} attribute blocks",
            metadata.len(),
            attributes.len()
        );
    }
    let body: usize = metadata.iter().chain(attributes).map(Vec::len).sum();
    let total = U64 + 2 * metadata.len() * U64 + body;

    let mut buffer = FormatBuffer::with_capacity(endianness, total);
    buffer.put(total as u64);
    for block in metadata.iter().chain(attributes) {
        buffer.put(block.len() as u64);
    }
    for block in metadata.iter().chain(attributes) {
        buffer.put_bytes(block);
    }
    Ok(buffer.into_inner())
}

/// Slice a combined metadata block into per-writer metadata and attribute blocks without
/// copying.
pub fn split_combined_metadata(
    block: &Bytes,
    writer_count: usize,
    endianness: Endianness,
) -> BpResult<Vec<WriterMetadataSlices>> {
    let mut reader = FormatReader::new(block, endianness);
    let total = reader.get::<u64>()?;
    if total != block.len() as u64 {
        bp_bail!(
            IncompatibleFormat: "combined metadata block claims {total} bytes, index says {}",
            block.len()
        );
    }
    let lengths = (0..2 * writer_count)
        .map(|_| reader.get::<u64>())
        .collect::<BpResult<Vec<_>>>()?;

    let mut offset = reader.position();
    let mut slices = Vec::with_capacity(2 * writer_count);
    for len in lengths {
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= block.len())
            .ok_or_else(|| {
                bp_err!(
                    IncompatibleFormat: "metadata block of {len} bytes at {offset} overruns the combined block of {}",
                    block.len()
                )
            })?;
        slices.push(block.slice(offset..end));
        offset = end;
    }
    let attributes = slices.split_off(writer_count);
    Ok(slices
        .into_iter()
        .zip(attributes)
        .map(|(metadata, attributes)| WriterMetadataSlices {
            metadata,
            attributes,
        })
        .collect())
}

/// One `(IDLen, InfoLen, ID, Info)` entry of `mmd.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMetaRecord {
    pub id: Vec<u8>,
    pub info: Vec<u8>,
}

impl MetaMetaRecord {
    pub fn encode(&self, buffer: &mut FormatBuffer) {
        buffer.put(self.id.len() as u64);
        buffer.put(self.info.len() as u64);
        buffer.put_bytes(&self.id);
        buffer.put_bytes(&self.info);
    }

    pub fn encoded_len(&self) -> usize {
        2 * U64 + self.id.len() + self.info.len()
    }
}

/// Decode every complete record at the start of `buffer`, returning them and the number of
/// bytes they span. A partial trailing record is left for the next call.
pub fn decode_meta_meta_records(
    buffer: &[u8],
    endianness: Endianness,
) -> BpResult<(Vec<MetaMetaRecord>, usize)> {
    let mut records = Vec::new();
    let mut reader = FormatReader::new(buffer, endianness);
    loop {
        let start = reader.position();
        if reader.remaining() < 2 * U64 {
            return Ok((records, start));
        }
        let id_len = reader.get::<u64>()?;
        let info_len = reader.get::<u64>()?;
        let (Ok(id_len), Ok(info_len)) = (usize::try_from(id_len), usize::try_from(info_len))
        else {
            bp_bail!(IncompatibleFormat: "meta-metadata record at {start} of {id_len} + {info_len} bytes");
        };
        let Some(record_len) = id_len.checked_add(info_len) else {
            bp_bail!(IncompatibleFormat: "meta-metadata record at {start} of {id_len} + {info_len} bytes");
        };
        if reader.remaining() < record_len {
            return Ok((records, start));
        }
        let id = reader.get_bytes(id_len)?.to_vec();
        let info = reader.get_bytes(info_len)?.to_vec();
        records.push(MetaMetaRecord { id, info });
    }
}

/// The format descriptors installed so far, keyed by id.
///
/// `mmd.0` only grows, so installation resumes from the number of bytes already consumed.
#[derive(Debug, Default)]
pub struct MetaMetadataTable {
    formats: FxHashMap<FormatId, FormatDescriptor>,
    consumed: u64,
}

impl MetaMetadataTable {
    /// Install records from `buffer`, which holds `mmd.0` bytes starting at `consumed()`.
    /// Returns the number of new descriptors.
    pub fn install(&mut self, buffer: &[u8], endianness: Endianness) -> BpResult<usize> {
        let (records, used) = decode_meta_meta_records(buffer, endianness)?;
        let mut installed = 0;
        for record in records {
            let id = FormatId::try_from(record.id.as_slice())?;
            if self.formats.contains_key(&id) {
                continue;
            }
            self.formats.insert(id, FormatDescriptor::decode(&record.info)?);
            installed += 1;
        }
        self.consumed += used as u64;
        Ok(installed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn get(&self, id: &FormatId) -> Option<&FormatDescriptor> {
        self.formats.get(id)
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

/// Writer-side dedup of descriptors already appended to `mmd.0`.
#[derive(Debug, Default)]
pub struct MetaMetadataLog {
    written: FxHashSet<FormatId>,
}

impl MetaMetadataLog {
    /// Encode the records of `descriptors` not yet written, marking them written.
    pub fn append_new(
        &mut self,
        descriptors: impl IntoIterator<Item = MetaMetaRecord>,
        endianness: Endianness,
    ) -> BpResult<Vec<u8>> {
        let mut buffer = FormatBuffer::new(endianness);
        for record in descriptors {
            let id = FormatId::try_from(record.id.as_slice())?;
            if self.written.insert(id) {
                record.encode(&mut buffer);
            }
        }
        Ok(buffer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use bp_error::BpError;
    use rstest::rstest;

    use super::*;
    use crate::dtype::DataType;
    use crate::schema::{ShapeKind, VarFormat};

    fn descriptor(name: &str) -> FormatDescriptor {
        FormatDescriptor {
            variables: vec![VarFormat {
                name: name.to_string(),
                dtype: DataType::F64,
                shape_kind: ShapeKind::GlobalArray,
                ndims: 2,
                operator: None,
            }],
        }
    }

    #[rstest]
    #[case(Endianness::Little)]
    #[case(Endianness::Big)]
    fn combined_block_slices_per_writer(#[case] endianness: Endianness) {
        let metadata = vec![b"first".to_vec(), b"second writer".to_vec(), Vec::new()];
        let attributes = vec![b"attrs".to_vec(), Vec::new(), Vec::new()];
        let block = Bytes::from(encode_combined_metadata(&metadata, &attributes, endianness).unwrap());
        assert_eq!(block.len(), 8 + 6 * 8 + 5 + 13 + 5);

        let slices = split_combined_metadata(&block, 3, endianness).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].metadata.as_ref(), b"first");
        assert_eq!(slices[0].attributes.as_ref(), b"attrs");
        assert_eq!(slices[1].metadata.as_ref(), b"second writer");
        assert!(slices[1].attributes.is_empty());
        assert!(slices[2].metadata.is_empty());
    }

    #[test]
    fn combined_block_size_must_match() {
        let block = encode_combined_metadata(&[b"abc".to_vec()], &[Vec::new()], Endianness::native())
            .unwrap();
        let short = Bytes::from(block[..block.len() - 1].to_vec());
        assert!(split_combined_metadata(&short, 1, Endianness::native()).is_err());
    }

    #[rstest]
    #[case::overruns(100)]
    #[case::wraps_the_offset(u64::MAX)]
    #[case::wraps_after_the_first_block(u64::MAX - 10)]
    fn oversized_writer_lengths_are_malformed(#[case] len: u64) {
        let endianness = Endianness::native();
        let mut block =
            encode_combined_metadata(&[b"abc".to_vec()], &[b"xy".to_vec()], endianness).unwrap();
        block[8..16].copy_from_slice(&len.to_ne_bytes());
        let block = Bytes::from(block);
        assert!(matches!(
            split_combined_metadata(&block, 1, endianness),
            Err(BpError::IncompatibleFormat(..))
        ));
    }

    #[rstest]
    #[case::id_len(u64::MAX, 2)]
    #[case::info_len(8, u64::MAX)]
    #[case::sum(u64::MAX / 2 + 1, u64::MAX / 2 + 1)]
    fn overflowing_record_lengths_are_malformed(#[case] id_len: u64, #[case] info_len: u64) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&id_len.to_le_bytes());
        bytes.extend_from_slice(&info_len.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            decode_meta_meta_records(&bytes, Endianness::Little),
            Err(BpError::IncompatibleFormat(..))
        ));
    }

    #[test]
    fn record_longer_than_the_buffer_waits_for_more() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&8u64.to_le_bytes());
        bytes.extend_from_slice(&1_000u64.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);
        let (records, used) = decode_meta_meta_records(&bytes, Endianness::Little).unwrap();
        assert!(records.is_empty());
        assert_eq!(used, 0);
    }

    #[test]
    fn meta_metadata_installs_incrementally() {
        let records: Vec<_> = ["a", "b", "a"]
            .iter()
            .map(|name| descriptor(name).to_record().unwrap())
            .collect();
        let mut log = MetaMetadataLog::default();
        let bytes = log.append_new(records.clone(), Endianness::native()).unwrap();
        assert_eq!(bytes.len(), records[0].encoded_len() + records[1].encoded_len());
        assert!(log.append_new(records, Endianness::native()).unwrap().is_empty());

        let mut table = MetaMetadataTable::default();
        let split = 5;
        assert_eq!(table.install(&bytes[..split], Endianness::native()).unwrap(), 0);
        assert_eq!(table.consumed(), 0);
        let rest = &bytes[table.consumed() as usize..];
        assert_eq!(table.install(rest, Endianness::native()).unwrap(), 2);
        assert_eq!(table.consumed(), bytes.len() as u64);
        assert_eq!(table.len(), 2);

        let id = descriptor("b").id().unwrap();
        assert_eq!(table.get(&id), Some(&descriptor("b")));
    }
}
