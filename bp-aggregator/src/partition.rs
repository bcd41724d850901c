use std::ops::Range;

/// Split `processes` ranks into `groups` contiguous ranges whose sizes differ by at most one.
///
/// With `base = processes / groups` and `rem = processes % groups`, the first `rem` groups hold
/// `base + 1` ranks. `groups` is clamped to `1..=processes`.
///
/// Placing the wider groups first is not the `floor(rank / (processes / groups))` rule some BP5
/// writers use for shared-memory groups, which interleaves them: 8 ranks over 5 groups are
/// 2,2,2,1,1 here and 2,2,1,2,1 there. Subfile assignment is recorded in the index, so readers
/// do not depend on either layout.
pub fn partition(processes: usize, groups: usize) -> Vec<Range<usize>> {
    let groups = clamp_groups(processes, groups);
    let base = processes / groups;
    let rem = processes % groups;
    let mut start = 0;
    (0..groups)
        .map(|g| {
            let len = base + usize::from(g < rem);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// The group `rank` falls into under [`partition`], without materialising the ranges.
pub fn group_of(rank: usize, processes: usize, groups: usize) -> usize {
    let groups = clamp_groups(processes, groups);
    let base = processes / groups;
    let rem = processes % groups;
    let wide = rem * (base + 1);
    if rank < wide {
        rank / (base + 1)
    } else {
        rem + (rank - wide) / base.max(1)
    }
}

fn clamp_groups(processes: usize, groups: usize) -> usize {
    groups.clamp(1, processes.max(1))
}
