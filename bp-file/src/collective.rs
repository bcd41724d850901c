//! Rank-0 decisions shared with the rest of the communicator.
//!
//! File-system probes and metadata appends run on rank 0 only. Their outcome is broadcast as
//! a status word so every rank returns the same result and no rank is left waiting in a
//! collective the others skipped.

use std::io;

use bp_comm::CommRef;
use bp_error::{BpError, BpResult, bp_bail, bp_err};

const STATUS_OK: u64 = 0;
const STATUS_TIMEOUT: u64 = 1;
const STATUS_ERROR: u64 = 2;

/// Run `f` on rank 0 and make every rank fail if it failed there. Collective.
pub(crate) fn on_root<T>(
    comm: &CommRef,
    what: &str,
    f: impl FnOnce() -> BpResult<T>,
) -> BpResult<Option<T>> {
    let result = (comm.rank() == 0).then(f).transpose();
    let failed = comm.broadcast_value(u64::from(result.is_err()), 0)?;
    match result {
        Err(e) => Err(e.with_context(format!("rank 0 failed to {what}"))),
        Ok(_) if failed != STATUS_OK => Err(bp_err!("rank 0 failed to {what}")),
        Ok(value) => Ok(value),
    }
}

/// Run `probe` on rank 0 and hand its values to every rank. Collective.
///
/// `Ok(None)` from the probe means it timed out; every rank then fails with `NotFound`.
pub(crate) fn from_root<const N: usize>(
    comm: &CommRef,
    what: &str,
    probe: impl FnOnce() -> BpResult<Option<[u64; N]>>,
) -> BpResult<[u64; N]> {
    let local = (comm.rank() == 0).then(probe).transpose().map(Option::flatten);
    let mut packed = Vec::with_capacity((N + 1) * size_of::<u64>());
    let (status, values) = match &local {
        Ok(Some(values)) => (STATUS_OK, *values),
        Ok(None) => (STATUS_TIMEOUT, [0; N]),
        Err(_) => (STATUS_ERROR, [0; N]),
    };
    for word in std::iter::once(status).chain(values) {
        packed.extend_from_slice(&word.to_le_bytes());
    }
    comm.broadcast(&mut packed, 0)?;

    if let Err(e) = local {
        return Err(e.with_context(format!("failed to {what}")));
    }
    let words = packed
        .chunks_exact(size_of::<u64>())
        .map(|chunk| {
            let mut raw = [0u8; size_of::<u64>()];
            raw.copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect::<Vec<_>>();
    if words.len() != N + 1 {
        bp_bail!(Comm: "rank 0 shared {} words, expected {}", words.len(), N + 1);
    }
    match words[0] {
        STATUS_OK => {
            let mut values = [0; N];
            values.copy_from_slice(&words[1..]);
            Ok(values)
        }
        STATUS_TIMEOUT => Err(bp_err!(NotFound: "timed out waiting to {what}")),
        _ => Err(BpError::from(io::Error::other(format!("rank 0 failed to {what}")))),
    }
}

#[cfg(test)]
mod tests {
    use bp_comm::LocalWorld;

    use super::*;

    #[test]
    fn every_rank_sees_the_root_values() {
        let results = LocalWorld::new(3).run(|comm| {
            from_root(&comm, "probe", || Ok(Some([7u64, 11]))).unwrap()
        });
        assert!(results.iter().all(|values| *values == [7, 11]));
    }

    #[test]
    fn root_timeout_is_not_found_everywhere() {
        let results = LocalWorld::new(2).run(|comm| {
            from_root::<1>(&comm, "find the dataset", || Ok(None))
                .unwrap_err()
                .is_not_found()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn root_failure_fails_every_rank() {
        let results = LocalWorld::new(3).run(|comm| {
            on_root(&comm, "append", || -> BpResult<()> { Err(bp_err!("disk full")) }).is_err()
        });
        assert_eq!(results, vec![true, true, true]);

        let values = LocalWorld::new(2).run(|comm| on_root(&comm, "append", || Ok(5)).unwrap());
        assert_eq!(values, vec![Some(5), None]);
    }
}
