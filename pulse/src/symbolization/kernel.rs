//! Kernel address resolution from `/proc/kallsyms`

use anyhow::{bail, Context, Result};
use log::info;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone)]
struct KernelSymbol {
    addr: u64,
    name: String,
    module: Option<String>,
}

/// Sorted kernel symbol table
///
/// Every address resolves to the closest symbol at or below it.
pub struct KernelSymbols {
    symbols: Vec<KernelSymbol>,
    cache: RefCell<HashMap<u64, String>>,
}

impl KernelSymbols {
    /// Read `/proc/kallsyms`.
    ///
    /// # Errors
    /// Fails if the file cannot be read or every address is hidden (reading
    /// real addresses requires root or `CAP_SYSLOG`).
    pub fn load() -> Result<Self> {
        let text = fs::read_to_string("/proc/kallsyms")
            .context("Failed to read /proc/kallsyms (requires root or CAP_SYSLOG)")?;
        let symbols = Self::parse(&text)?;
        info!("Loaded {} kernel symbols", symbols.len());
        Ok(symbols)
    }

    /// Parse kallsyms lines: `address type name [module]`.
    ///
    /// # Errors
    /// Fails when no usable symbol is found.
    pub fn parse(text: &str) -> Result<Self> {
        let mut hidden = 0usize;
        let mut symbols: Vec<KernelSymbol> = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let _kind = parts.next()?;
                let name = parts.next()?.to_string();
                let module = parts
                    .next()
                    .and_then(|m| m.strip_prefix('[')?.strip_suffix(']'))
                    .map(str::to_string);
                Some(KernelSymbol { addr, name, module })
            })
            .filter(|sym| {
                let visible = sym.addr != 0;
                if !visible {
                    hidden += 1;
                }
                visible
            })
            .collect();

        if symbols.is_empty() {
            if hidden > 0 {
                bail!("All kallsyms addresses are 0 (insufficient permissions)");
            }
            bail!("No kernel symbols found");
        }

        symbols.sort_by_key(|sym| sym.addr);
        Ok(Self { symbols, cache: RefCell::new(HashMap::new()) })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol containing `addr`, `name [module]` for module symbols.
    pub fn resolve(&self, addr: u64) -> Option<String> {
        if let Some(name) = self.cache.borrow().get(&addr) {
            return Some(name.clone());
        }

        let idx = self.symbols.partition_point(|sym| sym.addr <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        let name = match &sym.module {
            Some(module) => format!("{} [{module}]", sym.name),
            None => sym.name.clone(),
        };

        self.cache.borrow_mut().insert(addr, name.clone());
        Some(name)
    }
}
