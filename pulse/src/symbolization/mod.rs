//! # Symbol Resolution for Folded Stacks
//!
//! Turns raw instruction pointers from the stack trace map into function
//! names. Resolution is optional: any frame that cannot be named is printed
//! as a hex address.
//!
//! - **User frames**: DWARF via `addr2line`/`gimli`, falling back to the ELF
//!   symbol table (`object`) with `rustc-demangle`. Addresses inside a PIE
//!   binary are rebased using `/proc/<pid>/maps` first.
//! - **Kernel frames**: `/proc/kallsyms`, nearest symbol at or below.

pub mod kernel;
pub mod memory_maps;
pub mod symbolizer;

use log::warn;
use pulse_common::StackSpace;

pub use kernel::KernelSymbols;
pub use memory_maps::{parse_memory_maps, MemoryRange};
pub use symbolizer::Symbolizer;

/// Names for captured frames
pub trait FrameNames {
    /// Function names at `addr`, innermost inlined frame first. Empty if
    /// unknown.
    fn names(&self, space: StackSpace, addr: u64) -> Vec<String>;
}

/// Leaves every frame as a raw address
pub struct RawAddresses;

impl FrameNames for RawAddresses {
    fn names(&self, _space: StackSpace, _addr: u64) -> Vec<String> {
        Vec::new()
    }
}

/// User-space symbols of one process plus kernel symbols
pub struct ProcessSymbols {
    user: Option<(Symbolizer, Option<MemoryRange>)>,
    kernel: Option<KernelSymbols>,
}

impl ProcessSymbols {
    /// Best-effort setup; every missing piece is logged and skipped.
    #[must_use]
    pub fn load(pid: u32, binary_path: &str) -> Self {
        let user = match Symbolizer::new(binary_path) {
            Ok(symbolizer) => {
                let range = if symbolizer.is_pie() {
                    parse_memory_maps(pid, binary_path)
                        .map_err(|e| warn!("Failed to get memory range: {e}. PIE frames stay raw."))
                        .ok()
                } else {
                    None
                };
                Some((symbolizer, range))
            }
            Err(e) => {
                warn!("User symbols unavailable for {binary_path}: {e}");
                None
            }
        };

        let kernel = KernelSymbols::load()
            .map_err(|e| warn!("Kernel symbols unavailable: {e}"))
            .ok();

        Self { user, kernel }
    }
}

impl FrameNames for ProcessSymbols {
    fn names(&self, space: StackSpace, addr: u64) -> Vec<String> {
        match space {
            StackSpace::Kernel => {
                self.kernel.as_ref().and_then(|k| k.resolve(addr)).into_iter().collect()
            }
            StackSpace::User => {
                let Some((symbolizer, range)) = &self.user else {
                    return Vec::new();
                };
                let file_addr = match (symbolizer.is_pie(), range) {
                    (false, _) => Some(addr),
                    (true, Some(range)) => range.file_address(addr),
                    (true, None) => None,
                };
                file_addr.map(|a| symbolizer.resolve(a)).unwrap_or_default()
            }
        }
    }
}
