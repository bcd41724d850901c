use bp_error::BpResult;

use crate::operator::{Operator, OperatorParams};

/// Stores blocks unchanged behind the block header.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOperator;

impl Operator for NullOperator {
    fn name(&self) -> &str {
        "null"
    }

    fn encode(&self, raw: &[u8], _params: &OperatorParams) -> BpResult<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decode(&self, stream: &[u8], _raw_size: usize, _params: &OperatorParams) -> BpResult<Vec<u8>> {
        Ok(stream.to_vec())
    }
}
