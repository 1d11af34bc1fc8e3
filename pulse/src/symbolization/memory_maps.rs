//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` to find where a binary is loaded, which is
//! needed to turn runtime addresses of a position-independent executable
//! back into file addresses.

use anyhow::{Context, Result};
use log::info;
use std::fs;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// File address of `addr` for a binary whose first mapping is at offset 0
    #[must_use]
    pub fn file_address(&self, addr: u64) -> Option<u64> {
        self.contains(addr).then(|| addr - self.start)
    }
}

/// Span of every mapping of `binary_path` in a maps listing.
#[must_use]
pub fn find_binary_range(maps: &str, binary_path: &str) -> Option<MemoryRange> {
    let mut range: Option<MemoryRange> = None;

    for line in maps.lines() {
        // "start-end perms offset dev inode pathname"
        let mut parts = line.split_whitespace();
        let Some(span) = parts.next() else { continue };
        if parts.nth(4) != Some(binary_path) {
            continue;
        }
        let Some((start, end)) = span.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };

        range = Some(match range {
            Some(r) => MemoryRange { start: r.start.min(start), end: r.end.max(end) },
            None => MemoryRange { start, end },
        });
    }

    range
}

/// Parse /proc/pid/maps to find the memory range of a specific binary
///
/// # Errors
/// Returns an error if /proc/pid/maps cannot be read or if the binary is not found
pub fn parse_memory_maps(pid: u32, binary_path: &str) -> Result<MemoryRange> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;

    let range = find_binary_range(&maps, binary_path)
        .with_context(|| format!("Could not find memory range for {binary_path}"))?;
    info!(
        "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 131 /usr/bin/server
55d0c0a20000-55d0c0b00000 r-xp 00020000 08:01 131 /usr/bin/server
7f1e2a000000-7f1e2a1c0000 r-xp 00000000 08:01 200 /usr/lib/libc.so.6
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert_eq!(range.file_address(0x1780), Some(0x780));
    }

    #[test]
    fn test_find_binary_range_spans_all_mappings() {
        let range = find_binary_range(MAPS, "/usr/bin/server").unwrap();
        assert_eq!(range, MemoryRange { start: 0x55d0_c0a0_0000, end: 0x55d0_c0b0_0000 });
        assert!(find_binary_range(MAPS, "/usr/bin/other").is_none());
    }

    #[test]
    fn test_parse_memory_maps_missing_pid() {
        assert!(parse_memory_maps(999_999_999, "/usr/bin/server").is_err());
    }
}
