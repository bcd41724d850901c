//! Serialized per-writer metadata.
//!
//! A writer describes the variables it produced in a step with a [`FormatDescriptor`], stored
//! once in `mmd.0` and referenced by id, and a [`WriterMetadata`] listing every block. Both
//! are flexbuffers-encoded.

use std::hash::Hasher;

use bp_error::{BpResult, bp_err};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::metadata::MetaMetaRecord;
use crate::operator::BlockOperationInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    /// One value for the whole job, written by any single rank.
    GlobalValue,
    /// An array with a global shape assembled from blocks of many writers.
    GlobalArray,
    /// One value per writer.
    LocalValue,
    /// Independent per-writer arrays without a global shape.
    LocalArray,
}

impl ShapeKind {
    pub fn is_array(self) -> bool {
        matches!(self, Self::GlobalArray | Self::LocalArray)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarFormat {
    pub name: String,
    pub dtype: DataType,
    pub shape_kind: ShapeKind,
    pub ndims: u32,
    pub operator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub variables: Vec<VarFormat>,
}

/// The 8-byte key of a format descriptor in `mmd.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatId(pub [u8; 8]);

impl TryFrom<&[u8]> for FormatId {
    type Error = bp_error::BpError;

    fn try_from(value: &[u8]) -> BpResult<Self> {
        <[u8; 8]>::try_from(value)
            .map(Self)
            .map_err(|_| bp_err!(IncompatibleFormat: "format id of {} bytes, expected 8", value.len()))
    }
}

impl FormatDescriptor {
    pub fn encode(&self) -> BpResult<Vec<u8>> {
        Ok(flexbuffers::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> BpResult<Self> {
        Ok(flexbuffers::from_slice(bytes)?)
    }

    /// Stable id of the encoded descriptor.
    pub fn id(&self) -> BpResult<FormatId> {
        Ok(Self::id_of(&self.encode()?))
    }

    fn id_of(encoded: &[u8]) -> FormatId {
        let mut hasher = FxHasher::default();
        hasher.write(encoded);
        FormatId(hasher.finish().to_le_bytes())
    }

    pub fn to_record(&self) -> BpResult<MetaMetaRecord> {
        let info = self.encode()?;
        Ok(MetaMetaRecord {
            id: Self::id_of(&info).0.to_vec(),
            info,
        })
    }
}

/// One block of one variable as written by a single writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Index into the writer's [`FormatDescriptor::variables`].
    pub var_index: u32,
    /// Global shape, empty for local arrays and values.
    pub shape: Vec<u64>,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    /// Offset of the block within the writer's payload for the step.
    pub payload_offset: u64,
    pub payload_size: u64,
    pub operation: Option<BlockOperationInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub format_id: FormatId,
    /// Total payload bytes this writer produced in the step, across all flushes.
    pub data_size: u64,
    pub blocks: Vec<BlockMeta>,
}

impl WriterMetadata {
    pub fn encode(&self) -> BpResult<Vec<u8>> {
        Ok(flexbuffers::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> BpResult<Self> {
        Ok(flexbuffers::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    TextArray(Vec<String>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(vec![value])
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::UInt(vec![value])
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(vec![value])
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(value: Vec<f64>) -> Self {
        Self::Float(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// The full attribute set of a writer, re-sent whenever it changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeBlock {
    pub attributes: Vec<Attribute>,
}

impl AttributeBlock {
    pub fn encode(&self) -> BpResult<Vec<u8>> {
        Ok(flexbuffers::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> BpResult<Self> {
        Ok(flexbuffers::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OperatorParams;

    fn descriptor() -> FormatDescriptor {
        FormatDescriptor {
            variables: vec![
                VarFormat {
                    name: "temperature".into(),
                    dtype: DataType::F64,
                    shape_kind: ShapeKind::GlobalArray,
                    ndims: 2,
                    operator: Some("bzip2".into()),
                },
                VarFormat {
                    name: "step".into(),
                    dtype: DataType::U32,
                    shape_kind: ShapeKind::GlobalValue,
                    ndims: 0,
                    operator: None,
                },
            ],
        }
    }

    #[test]
    fn descriptor_id_is_stable() {
        let a = descriptor();
        assert_eq!(a.id().unwrap(), a.clone().id().unwrap());
        let mut b = descriptor();
        b.variables[1].name = "time".into();
        assert_ne!(a.id().unwrap(), b.id().unwrap());

        let record = a.to_record().unwrap();
        assert_eq!(record.id, a.id().unwrap().0.to_vec());
        assert_eq!(FormatDescriptor::decode(&record.info).unwrap(), a);
    }

    #[test]
    fn writer_metadata_round_trip() {
        let metadata = WriterMetadata {
            format_id: descriptor().id().unwrap(),
            data_size: 4096,
            blocks: vec![BlockMeta {
                var_index: 0,
                shape: vec![10, 20],
                start: vec![0, 10],
                count: vec![10, 10],
                payload_offset: 0,
                payload_size: 917,
                operation: Some(BlockOperationInfo {
                    operator: "bzip2".into(),
                    element_count: 100,
                    dtype: DataType::F64,
                    pre_size: 800,
                    payload_size: 917,
                    params: OperatorParams::new(),
                }),
            }],
        };
        let bytes = metadata.encode().unwrap();
        assert_eq!(WriterMetadata::decode(&bytes).unwrap(), metadata);
    }

    #[test]
    fn attributes_round_trip() {
        let block = AttributeBlock {
            attributes: vec![
                Attribute {
                    name: "units".into(),
                    value: "kelvin".into(),
                },
                Attribute {
                    name: "dt".into(),
                    value: 0.5f64.into(),
                },
            ],
        };
        assert_eq!(AttributeBlock::decode(&block.encode().unwrap()).unwrap(), block);
        assert!(FormatId::try_from([1u8, 2, 3].as_slice()).is_err());
    }
}
