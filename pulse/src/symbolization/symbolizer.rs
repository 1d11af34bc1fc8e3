use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Resolves file addresses of one binary to function names
///
/// DWARF is preferred because it reports inlined frames. Binaries without
/// DWARF fall back to the ELF symbol table. Results are cached per address.
pub struct Symbolizer {
    ctx: Option<Context<EndianRcSlice<RunTimeEndian>>>,
    /// Function symbols sorted by start address: (start, size, demangled name)
    symbols: Vec<(u64, u64, String)>,
    is_pie: bool,
    cache: RefCell<HashMap<u64, Vec<String>>>,
}

impl Symbolizer {
    /// Create a new symbolizer for the given binary
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref()).context("Failed to read binary file")?;
        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let has_dwarf = obj_file.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
        let ctx = if has_dwarf {
            let dwarf = gimli::Dwarf::load(&load_section)?;
            Some(Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?)
        } else {
            None
        };

        let mut symbols: Vec<(u64, u64, String)> = obj_file
            .symbols()
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some((sym.address(), sym.size(), Self::demangle_symbol(name)))
            })
            .collect();
        symbols.sort_by_key(|(addr, _, _)| *addr);

        Ok(Self {
            ctx,
            symbols,
            is_pie: obj_file.kind() == ObjectKind::Dynamic,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// Position-independent executables need runtime addresses rebased
    #[must_use]
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// Function names at `addr`, innermost inlined frame first.
    ///
    /// Empty when nothing covers the address.
    pub fn resolve(&self, addr: u64) -> Vec<String> {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut names = self.resolve_dwarf(addr);
        if names.is_empty() {
            names.extend(self.resolve_symtab(addr));
        }

        self.cache.borrow_mut().insert(addr, names.clone());
        names
    }

    fn resolve_dwarf(&self, addr: u64) -> Vec<String> {
        let mut names = Vec::new();
        let Some(ctx) = &self.ctx else {
            return names;
        };
        if let Ok(mut frames) = ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frames.next() {
                if let Some(name) =
                    frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                {
                    names.push(name);
                }
            }
        }
        names
    }

    fn resolve_symtab(&self, addr: u64) -> Option<String> {
        let idx = self.symbols.partition_point(|(start, _, _)| *start <= addr);
        let (start, size, name) = self.symbols.get(idx.checked_sub(1)?)?;
        (*size == 0 || addr < start + size).then(|| name.clone())
    }

    /// Demangle a Rust symbol name (C names pass through unchanged)
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol() {
        let mangled = "_ZN4core3fmt5write17h0123456789abcdefE";
        assert_eq!(Symbolizer::demangle_symbol(mangled), "core::fmt::write");
        assert_eq!(Symbolizer::demangle_symbol("memcpy"), "memcpy");
    }

    #[test]
    fn test_missing_binary_fails() {
        assert!(Symbolizer::new("/nonexistent/binary").is_err());
    }
}
