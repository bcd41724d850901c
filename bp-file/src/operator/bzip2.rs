use std::io::{Read, Write};

use bp_error::{BpResult, bp_bail, bp_err};
use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;

use crate::operator::{Operator, OperatorParams};

pub const BLOCK_SIZE_PARAM: &str = "blockSize100k";
const DEFAULT_BLOCK_SIZE: u32 = 9;

/// bzip2 with a configurable block size of `1..=9` hundred kilobytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bzip2Operator;

impl Bzip2Operator {
    fn block_size(params: &OperatorParams) -> BpResult<u32> {
        let Some(value) = params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(BLOCK_SIZE_PARAM))
            .map(|(_, value)| value)
        else {
            return Ok(DEFAULT_BLOCK_SIZE);
        };
        let block_size: u32 = value
            .trim()
            .parse()
            .map_err(|_| bp_err!(InvalidArgument: "{BLOCK_SIZE_PARAM} must be an integer, got {value:?}"))?;
        if !(1..=9).contains(&block_size) {
            bp_bail!(InvalidArgument: "{BLOCK_SIZE_PARAM} must be between 1 and 9, got {block_size}");
        }
        Ok(block_size)
    }
}

impl Operator for Bzip2Operator {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn validate_params(&self, params: &OperatorParams) -> BpResult<()> {
        Self::block_size(params).map(|_| ())
    }

    fn encode(&self, raw: &[u8], params: &OperatorParams) -> BpResult<Vec<u8>> {
        let mut encoder = BzEncoder::new(
            Vec::with_capacity(raw.len() / 2),
            Compression::new(Self::block_size(params)?),
        );
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, stream: &[u8], raw_size: usize, _params: &OperatorParams) -> BpResult<Vec<u8>> {
        let mut raw = Vec::with_capacity(raw_size);
        BzDecoder::new(stream).read_to_end(&mut raw)?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::dtype::DataType;

    fn params(block_size: &str) -> OperatorParams {
        OperatorParams::from([(BLOCK_SIZE_PARAM.to_string(), block_size.to_string())])
    }

    #[rstest]
    #[case("1")]
    #[case("9")]
    fn compresses_and_restores(#[case] block_size: &str) {
        let raw: Vec<u8> = (0..4096u32).flat_map(|v| (v % 17).to_ne_bytes()).collect();
        let mut info = Bzip2Operator
            .set_metadata(4096, DataType::U32, &params(block_size))
            .unwrap();
        let payload = Bzip2Operator.set_data(&raw, &mut info).unwrap();
        assert!(payload.len() < raw.len());
        assert_eq!(info.payload_size, payload.len() as u64);
        assert_eq!(Bzip2Operator.get_data(&payload, &info).unwrap(), raw);
    }

    #[rstest]
    #[case("0")]
    #[case("10")]
    #[case("big")]
    fn block_size_is_validated(#[case] block_size: &str) {
        assert!(matches!(
            Bzip2Operator.set_metadata(1, DataType::U8, &params(block_size)),
            Err(bp_error::BpError::InvalidArgument(..))
        ));
    }
}
