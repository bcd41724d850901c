use std::ops::Range;

use bp_error::{BpResult, bp_err};
use bytes::Bytes;

use crate::BpReadAt;

/// Read several byte ranges from one transport, coalescing ranges whose gap is at most
/// `max_gap` into a single physical read.
///
/// Results are returned in the order of `ranges`. A range that runs past the end of the
/// transport is reported with the offset of the physical read that came up short.
pub fn read_byte_ranges<R: BpReadAt + ?Sized>(
    read: &R,
    name: &str,
    ranges: &[Range<u64>],
    max_gap: u64,
) -> BpResult<Vec<Bytes>> {
    let merged_ranges = merge_ranges(ranges.to_vec(), max_gap);
    let mut read_ranges = Vec::with_capacity(merged_ranges.len());
    for range in merged_ranges.iter() {
        read_ranges.push(read_exact(read, name, range.clone())?);
    }

    let mut result_bytes = Vec::with_capacity(ranges.len());
    for range in ranges {
        let read_idx = merged_ranges.partition_point(|mr| mr.start <= range.start) - 1;
        let read_range_start = merged_ranges[read_idx].start;
        let read_bytes = &read_ranges[read_idx];
        let start = usize::try_from(range.start - read_range_start)
            .map_err(|_| bp_err!("range start {} does not fit in memory", range.start))?;
        let end = usize::try_from(range.end - read_range_start)
            .map_err(|_| bp_err!("range end {} does not fit in memory", range.end))?;
        result_bytes.push(read_bytes.slice(start..end));
    }

    Ok(result_bytes)
}

/// Read exactly `range`, failing with [`bp_error::BpError::IoTruncated`] on a short read.
pub fn read_exact<R: BpReadAt + ?Sized>(read: &R, name: &str, range: Range<u64>) -> BpResult<Bytes> {
    let expected = range.end.saturating_sub(range.start);
    let len = usize::try_from(expected)
        .map_err(|_| bp_err!(InvalidArgument: "read of {expected} bytes does not fit in memory"))?;
    let mut buffer = vec![0u8; len];
    let actual = read.read_fully_at(&mut buffer, range.start)?;
    if actual < len {
        return Err(bp_err!(IoTruncated: name.to_string(), range.start, expected, actual as u64));
    }
    Ok(Bytes::from(buffer))
}

/// Sort and merge ranges whose gaps are at most `max_gap` bytes. Overlapping ranges always merge.
pub fn merge_ranges(mut ranges: Vec<Range<u64>>, max_gap: u64) -> Vec<Range<u64>> {
    if ranges.is_empty() {
        return Vec::new();
    }

    ranges.sort_unstable_by_key(|r| r.start);
    let mut merged_ranges = Vec::with_capacity(ranges.len());

    let mut start_idx = 0;
    let mut end_idx = 1;

    while start_idx < ranges.len() {
        let mut range_end = ranges[start_idx].end;

        while end_idx < ranges.len()
            && ranges[end_idx]
                .start
                .checked_sub(range_end)
                .map(|gap| gap <= max_gap)
                .unwrap_or(true)
        {
            range_end = range_end.max(ranges[end_idx].end);
            end_idx += 1;
        }

        merged_ranges.push(ranges[start_idx].start..range_end);
        start_idx = end_idx;
        end_idx += 1;
    }

    merged_ranges
}
