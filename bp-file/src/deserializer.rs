use std::collections::BTreeMap;

use bp_error::{BpResult, bp_bail, bp_err};

use crate::dtype::DataType;
use crate::metadata::{MetaMetadataTable, WriterMetadataSlices};
use crate::operator::BlockOperationInfo;
use crate::schema::{AttributeBlock, AttributeValue, ShapeKind, WriterMetadata};

/// One on-disk block of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Rank of the writer that produced the block.
    pub writer: usize,
    /// Position of the block among this writer's blocks of the variable.
    pub writer_block: usize,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    pub payload_offset: u64,
    pub payload_size: u64,
    pub operation: Option<BlockOperationInfo>,
}

impl BlockInfo {
    pub fn element_count(&self) -> u64 {
        self.count.iter().product()
    }
}

/// A variable as seen in one step, assembled from every writer's blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub dtype: DataType,
    pub shape_kind: ShapeKind,
    /// Global shape; empty unless the variable is a global array.
    pub shape: Vec<u64>,
    pub blocks: Vec<BlockInfo>,
}

impl VarInfo {
    pub fn ndims(&self) -> usize {
        match self.blocks.first() {
            Some(block) => block.count.len(),
            None => self.shape.len(),
        }
    }

    pub fn writer_blocks(&self, writer: usize) -> impl Iterator<Item = &BlockInfo> {
        self.blocks.iter().filter(move |b| b.writer == writer)
    }

    pub fn block(&self, writer: usize, block: usize) -> BpResult<&BlockInfo> {
        self.writer_blocks(writer).nth(block).ok_or_else(|| {
            bp_err!(
                InvalidArgument: "writer {writer} wrote no block {block} of {}",
                self.name
            )
        })
    }
}

/// The queryable metadata of one installed step.
///
/// Built from the step's combined metadata block; holds only block descriptions. Reads are
/// planned against it and executed through the reader's transports.
#[derive(Debug, Clone, Default)]
pub struct StepVariables {
    step: usize,
    variables: BTreeMap<String, VarInfo>,
    data_sizes: Vec<u64>,
}

impl StepVariables {
    /// Decode every writer's metadata for `step`.
    ///
    /// Non-empty attribute blocks replace the attributes of their writer in `attributes`.
    /// `reverse_dims` flips every dimension vector, for datasets written in the other array
    /// order.
    pub fn install(
        step: usize,
        writers: &[WriterMetadataSlices],
        formats: &MetaMetadataTable,
        reverse_dims: bool,
        attributes: &mut BTreeMap<String, AttributeValue>,
    ) -> BpResult<Self> {
        let mut variables: BTreeMap<String, VarInfo> = BTreeMap::new();
        let mut data_sizes = Vec::with_capacity(writers.len());

        for (writer, slices) in writers.iter().enumerate() {
            if !slices.attributes.is_empty() {
                for attribute in AttributeBlock::decode(&slices.attributes)?.attributes {
                    attributes.insert(attribute.name, attribute.value);
                }
            }
            if slices.metadata.is_empty() {
                data_sizes.push(0);
                continue;
            }

            let metadata = WriterMetadata::decode(&slices.metadata)?;
            let format = formats.get(&metadata.format_id).ok_or_else(|| {
                bp_err!(
                    IncompatibleFormat: "writer {writer} references unknown format {:?} at step {step}",
                    metadata.format_id
                )
            })?;
            data_sizes.push(metadata.data_size);

            let mut per_var_blocks: BTreeMap<u32, usize> = BTreeMap::new();
            for block in metadata.blocks {
                let var = format.variables.get(block.var_index as usize).ok_or_else(|| {
                    bp_err!(
                        IncompatibleFormat: "writer {writer} block names variable {} of {}",
                        block.var_index,
                        format.variables.len()
                    )
                })?;
                if block
                    .payload_offset
                    .checked_add(block.payload_size)
                    .is_none_or(|end| end > metadata.data_size)
                {
                    bp_bail!(
                        IncompatibleFormat: "block of {} at {}+{} lies outside writer {writer}'s {} byte payload",
                        var.name,
                        block.payload_offset,
                        block.payload_size,
                        metadata.data_size
                    );
                }

                let mut shape = block.shape;
                let mut start = block.start;
                let mut count = block.count;
                if reverse_dims {
                    shape.reverse();
                    start.reverse();
                    count.reverse();
                }

                let info = variables.entry(var.name.clone()).or_insert_with(|| VarInfo {
                    name: var.name.clone(),
                    dtype: var.dtype,
                    shape_kind: var.shape_kind,
                    shape: shape.clone(),
                    blocks: Vec::new(),
                });
                if info.dtype != var.dtype || info.shape_kind != var.shape_kind {
                    bp_bail!(
                        IncompatibleFormat: "{} is {} {:?} in one writer and {} {:?} in writer {writer}",
                        var.name,
                        info.dtype,
                        info.shape_kind,
                        var.dtype,
                        var.shape_kind
                    );
                }
                if var.shape_kind == ShapeKind::GlobalArray && info.shape != shape {
                    bp_bail!(
                        IncompatibleFormat: "writers disagree on the shape of {}: {:?} vs {:?}",
                        var.name,
                        info.shape,
                        shape
                    );
                }

                let writer_block = per_var_blocks.entry(block.var_index).or_default();
                info.blocks.push(BlockInfo {
                    writer,
                    writer_block: *writer_block,
                    start,
                    count,
                    payload_offset: block.payload_offset,
                    payload_size: block.payload_size,
                    operation: block.operation,
                });
                *writer_block += 1;
            }
        }

        log::debug!(
            "installed step {step}: {} variables from {} writers",
            variables.len(),
            writers.len()
        );
        Ok(Self {
            step,
            variables,
            data_sizes,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn variable(&self, name: &str) -> BpResult<&VarInfo> {
        self.variables
            .get(name)
            .ok_or_else(|| bp_err!(NotFound: "variable {name} not present at step {}", self.step))
    }

    pub fn variables(&self) -> impl Iterator<Item = &VarInfo> {
        self.variables.values()
    }

    /// Payload bytes `writer` produced in this step.
    pub fn data_size(&self, writer: usize) -> BpResult<u64> {
        self.data_sizes
            .get(writer)
            .copied()
            .ok_or_else(|| bp_err!(OutOfBounds: writer, 0, self.data_sizes.len()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::format::Endianness;
    use crate::metadata::MetaMetadataLog;
    use crate::schema::{Attribute, BlockMeta, FormatDescriptor, VarFormat};

    fn format() -> FormatDescriptor {
        FormatDescriptor {
            variables: vec![VarFormat {
                name: "t".into(),
                dtype: DataType::F32,
                shape_kind: ShapeKind::GlobalArray,
                ndims: 2,
                operator: None,
            }],
        }
    }

    fn writer(offset_rows: u64) -> WriterMetadataSlices {
        let metadata = WriterMetadata {
            format_id: format().id().unwrap(),
            data_size: 64,
            blocks: (0..2)
                .map(|b| BlockMeta {
                    var_index: 0,
                    shape: vec![8, 4],
                    start: vec![offset_rows + 2 * b, 0],
                    count: vec![2, 4],
                    payload_offset: 32 * b,
                    payload_size: 32,
                    operation: None,
                })
                .collect(),
        };
        WriterMetadataSlices {
            metadata: Bytes::from(metadata.encode().unwrap()),
            attributes: Bytes::new(),
        }
    }

    fn table() -> MetaMetadataTable {
        let bytes = MetaMetadataLog::default()
            .append_new([format().to_record().unwrap()], Endianness::native())
            .unwrap();
        let mut table = MetaMetadataTable::default();
        table.install(&bytes, Endianness::native()).unwrap();
        table
    }

    #[test]
    fn blocks_are_ordered_by_writer() {
        let mut attributes = BTreeMap::new();
        let mut first = writer(0);
        first.attributes = Bytes::from(
            AttributeBlock {
                attributes: vec![Attribute {
                    name: "units".into(),
                    value: "K".into(),
                }],
            }
            .encode()
            .unwrap(),
        );
        let step = StepVariables::install(3, &[first, writer(4)], &table(), false, &mut attributes)
            .unwrap();

        let var = step.variable("t").unwrap();
        assert_eq!(var.shape, vec![8, 4]);
        assert_eq!(var.blocks.len(), 4);
        assert_eq!(
            var.blocks.iter().map(|b| (b.writer, b.writer_block)).collect::<Vec<_>>(),
            vec![(0, 0), (0, 1), (1, 0), (1, 1)]
        );
        assert_eq!(var.block(1, 1).unwrap().start, vec![6, 0]);
        assert!(var.block(1, 2).is_err());
        assert_eq!(step.data_size(1).unwrap(), 64);
        assert_eq!(attributes.get("units"), Some(&AttributeValue::Text("K".into())));
        assert!(step.variable("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn column_major_dimensions_are_reversed() {
        let step =
            StepVariables::install(0, &[writer(0)], &table(), true, &mut BTreeMap::new()).unwrap();
        let var = step.variable("t").unwrap();
        assert_eq!(var.shape, vec![4, 8]);
        assert_eq!(var.blocks[1].start, vec![0, 2]);
        assert_eq!(var.blocks[1].count, vec![4, 2]);
    }

    #[test]
    fn unknown_format_is_incompatible() {
        let result = StepVariables::install(
            0,
            &[writer(0)],
            &MetaMetadataTable::default(),
            false,
            &mut BTreeMap::new(),
        );
        assert!(matches!(result, Err(bp_error::BpError::IncompatibleFormat(..))));
    }

    #[rstest]
    #[case::past_the_payload(40, 32)]
    #[case::wraps(32, u64::MAX - 16)]
    fn block_outside_the_payload_is_incompatible(#[case] offset: u64, #[case] size: u64) {
        let metadata = WriterMetadata {
            format_id: format().id().unwrap(),
            data_size: 64,
            blocks: vec![BlockMeta {
                var_index: 0,
                shape: vec![8, 4],
                start: vec![0, 0],
                count: vec![2, 4],
                payload_offset: offset,
                payload_size: size,
                operation: None,
            }],
        };
        let slices = WriterMetadataSlices {
            metadata: Bytes::from(metadata.encode().unwrap()),
            attributes: Bytes::new(),
        };
        let result = StepVariables::install(0, &[slices], &table(), false, &mut BTreeMap::new());
        assert!(matches!(result, Err(bp_error::BpError::IncompatibleFormat(..))));
    }
}
