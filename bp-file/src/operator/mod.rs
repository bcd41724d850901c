//! Block-level compression operators.
//!
//! An operator turns one block's raw payload into an encoded stream prefixed by the in-band
//! block header `InputSize: u64, OutputSize: u64` (little-endian). The per-block
//! [`BlockOperationInfo`] travels in the writer's metadata so readers can find the operator
//! and size their buffers before decoding.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

use bp_error::{BpResult, bp_bail, bp_err};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::dtype::DataType;

#[cfg(feature = "bzip2")]
mod bzip2;
mod null;

#[cfg(feature = "bzip2")]
pub use self::bzip2::*;
pub use null::*;

/// String parameters of one operator, e.g. `blockSize100k`.
pub type OperatorParams = BTreeMap<String, String>;

/// Size of the in-band block header.
pub const BLOCK_HEADER_SIZE: usize = 2 * size_of::<u64>();

/// Operators the format knows about but this crate does not implement.
const KNOWN_ABSENT: [&str; 3] = ["zfp", "sz", "mgard"];

/// How a block's payload was encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOperationInfo {
    pub operator: String,
    pub element_count: u64,
    pub dtype: DataType,
    /// Size of the raw block before encoding.
    pub pre_size: u64,
    /// Size of the encoded payload, header included.
    pub payload_size: u64,
    pub params: OperatorParams,
}

pub trait Operator: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn validate_params(&self, _params: &OperatorParams) -> BpResult<()> {
        Ok(())
    }

    /// Encode a raw block into the operator's stream, without the block header.
    fn encode(&self, raw: &[u8], params: &OperatorParams) -> BpResult<Vec<u8>>;

    /// Decode a stream produced by [`Operator::encode`] into `raw_size` bytes.
    fn decode(&self, stream: &[u8], raw_size: usize, params: &OperatorParams) -> BpResult<Vec<u8>>;

    fn set_metadata(
        &self,
        element_count: u64,
        dtype: DataType,
        params: &OperatorParams,
    ) -> BpResult<BlockOperationInfo> {
        self.validate_params(params)?;
        Ok(BlockOperationInfo {
            operator: self.name().to_string(),
            element_count,
            dtype,
            pre_size: element_count * dtype.byte_width() as u64,
            payload_size: 0,
            params: params.clone(),
        })
    }

    fn update_metadata(&self, info: &mut BlockOperationInfo, payload_size: u64) {
        info.payload_size = payload_size;
    }

    /// Encode `raw` and prepend the block header, recording the payload size in `info`.
    fn set_data(&self, raw: &[u8], info: &mut BlockOperationInfo) -> BpResult<Vec<u8>> {
        if raw.len() as u64 != info.pre_size {
            bp_bail!(
                InvalidArgument: "{} expected a {} byte block, got {}",
                self.name(),
                info.pre_size,
                raw.len()
            );
        }
        let stream = self.encode(raw, &info.params)?;
        let mut payload = Vec::with_capacity(BLOCK_HEADER_SIZE + stream.len());
        payload.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        payload.extend_from_slice(&(stream.len() as u64).to_le_bytes());
        payload.extend_from_slice(&stream);
        self.update_metadata(info, payload.len() as u64);
        Ok(payload)
    }

    /// Strip the block header and decode the payload back into the raw block.
    fn get_data(&self, payload: &[u8], info: &BlockOperationInfo) -> BpResult<Vec<u8>> {
        let (input_size, stream) = split_block_header(payload)?;
        let raw_size = usize::try_from(input_size)
            .map_err(|_| bp_err!(IncompatibleFormat: "block of {input_size} bytes does not fit in memory"))?;
        let raw = self.decode(stream, raw_size, &info.params)?;
        if raw.len() != raw_size {
            bp_bail!(
                IncompatibleFormat: "{} decoded {} bytes, block header says {raw_size}",
                self.name(),
                raw.len()
            );
        }
        Ok(raw)
    }
}

/// Split an encoded payload into its recorded input size and the operator stream.
pub fn split_block_header(payload: &[u8]) -> BpResult<(u64, &[u8])> {
    if payload.len() < BLOCK_HEADER_SIZE {
        bp_bail!(
            IncompatibleFormat: "encoded block of {} bytes is shorter than its header",
            payload.len()
        );
    }
    let mut input = [0u8; 8];
    let mut output = [0u8; 8];
    input.copy_from_slice(&payload[..8]);
    output.copy_from_slice(&payload[8..BLOCK_HEADER_SIZE]);
    let output_size = u64::from_le_bytes(output) as usize;
    let stream = &payload[BLOCK_HEADER_SIZE..];
    if stream.len() < output_size {
        bp_bail!(
            IncompatibleFormat: "block header promises {output_size} encoded bytes, {} present",
            stream.len()
        );
    }
    Ok((u64::from_le_bytes(input), &stream[..output_size]))
}

/// The operators an engine may use, looked up by lower-case name.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: FxHashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    /// A registry holding only the built-in operators of this build.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(NullOperator));
        #[cfg(feature = "bzip2")]
        registry.register(Arc::new(Bzip2Operator));
        registry
    }

    pub fn register(&mut self, operator: Arc<dyn Operator>) {
        self.operators
            .insert(operator.name().to_ascii_lowercase(), operator);
    }

    pub fn get(&self, name: &str) -> BpResult<Arc<dyn Operator>> {
        let key = name.to_ascii_lowercase();
        if let Some(operator) = self.operators.get(&key) {
            return Ok(operator.clone());
        }
        if KNOWN_ABSENT.contains(&key.as_str()) || key == "bzip2" {
            Err(bp_err!(UnsupportedCodec: "operator {name} is not available in this build"))
        } else {
            Err(bp_err!(UnsupportedCodec: "unknown operator {name}"))
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }
}

/// The built-in operators, shared by engines opened without an explicit registry.
pub static DEFAULT_REGISTRY: LazyLock<Arc<OperatorRegistry>> =
    LazyLock::new(|| Arc::new(OperatorRegistry::builtin()));

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("zfp")]
    #[case("SZ")]
    #[case("mgard")]
    #[case("lz4-but-not-really")]
    fn missing_operators_are_unsupported(#[case] name: &str) {
        let registry = OperatorRegistry::builtin();
        assert!(matches!(
            registry.get(name),
            Err(bp_error::BpError::UnsupportedCodec(..))
        ));
    }

    #[test]
    fn null_operator_frames_the_block() {
        let registry = OperatorRegistry::builtin();
        let null = registry.get("null").unwrap();
        let raw: Vec<u8> = (0..32).collect();
        let mut info = null.set_metadata(8, DataType::F32, &OperatorParams::new()).unwrap();
        let payload = null.set_data(&raw, &mut info).unwrap();
        assert_eq!(info.payload_size, payload.len() as u64);
        assert_eq!(payload.len(), BLOCK_HEADER_SIZE + 32);
        assert_eq!(&payload[..8], &32u64.to_le_bytes());
        assert_eq!(null.get_data(&payload, &info).unwrap(), raw);
    }

    #[test]
    fn wrong_block_size_is_rejected() {
        let null = NullOperator;
        let mut info = null.set_metadata(4, DataType::F64, &OperatorParams::new()).unwrap();
        assert!(null.set_data(&[0u8; 8], &mut info).is_err());
    }

    #[test]
    fn truncated_header_is_incompatible() {
        assert!(split_block_header(&[0u8; 10]).is_err());
        let mut payload = 4u64.to_le_bytes().to_vec();
        payload.extend(100u64.to_le_bytes());
        payload.extend([1, 2, 3]);
        assert!(split_block_header(&payload).is_err());
    }
}
