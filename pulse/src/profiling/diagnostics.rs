use anyhow::{Context, Result};
use aya::maps::Array;
use aya::Ebpf;
use pulse_common::{DropReason, DROP_REASON_COUNT};

/// Snapshot of the kernel-side `DIAGNOSTICS` counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters([u64; DROP_REASON_COUNT as usize]);

impl DropCounters {
    #[must_use]
    pub fn from_counts(counts: [u64; DROP_REASON_COUNT as usize]) -> Self {
        Self(counts)
    }

    #[must_use]
    pub fn get(&self, reason: DropReason) -> u64 {
        self.0[reason.index() as usize]
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DropReason, u64)> + '_ {
        DropReason::ALL.iter().map(|&reason| (reason, self.get(reason)))
    }
}

/// Read the drop counters maintained by the eBPF programs
///
/// # Errors
/// Returns an error if the `DIAGNOSTICS` map cannot be accessed
pub fn read_drop_counters(bpf: &Ebpf) -> Result<DropCounters> {
    let array: Array<_, u64> =
        Array::try_from(bpf.map("DIAGNOSTICS").context("DIAGNOSTICS map not found")?)?;

    let mut counts = [0u64; DROP_REASON_COUNT as usize];
    for reason in DropReason::ALL {
        counts[reason.index() as usize] = array.get(&reason.index(), 0)?;
    }
    Ok(DropCounters(counts))
}

/// Print every non-zero drop counter
///
/// Drops are expected under load (full tables, racing CPUs); large numbers
/// point at undersized maps or a consumer that is too slow.
pub fn print_drop_diagnostics(counters: &DropCounters) {
    if counters.total() == 0 {
        println!("drops: none");
        return;
    }

    println!("drops:");
    for (reason, count) in counters.iter().filter(|(_, count)| *count > 0) {
        println!("   - {}: {count}", reason.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_counters_lookup() {
        let counters = DropCounters::from_counts([1, 0, 3, 0, 0, 2, 0]);
        assert_eq!(counters.get(DropReason::SampleTableFull), 1);
        assert_eq!(counters.get(DropReason::ExitWithoutEntry), 2);
        assert_eq!(counters.total(), 6);
        assert_eq!(counters.iter().filter(|(_, c)| *c > 0).count(), 3);
    }
}
