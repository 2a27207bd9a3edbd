//! Kernel symbol table from `/proc/kallsyms`
//!
//! ```text
//! ffffffff81000000 T _stext
//! ffffffffc0a01000 t xfs_alloc_read_agf	[xfs]
//! ```
//!
//! Only text symbols are kept. With `kptr_restrict` in effect every address
//! reads as zero, leaving an empty table; lookups then fall back to raw hex.

use anyhow::{Context, Result};
use rustc_demangle::demangle;
use std::path::Path;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    pub address: u64,
    pub name: String,
    /// Loadable module the symbol belongs to, `None` for vmlinux
    pub module: Option<String>,
}

/// Address-sorted kernel text symbols
#[derive(Debug, Default)]
pub struct KernelSymbols {
    symbols: Vec<KernelSymbol>,
}

impl KernelSymbols {
    /// Load `/proc/kallsyms`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn load() -> Result<Self> {
        Self::from_path(Path::new(KALLSYMS_PATH))
    }

    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut symbols: Vec<KernelSymbol> = content.lines().filter_map(parse_line).collect();
        symbols.sort_by_key(|s| s.address);
        Self { symbols }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Closest symbol at or below `address`, with the offset into it
    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<(&KernelSymbol, u64)> {
        let idx = self.symbols.partition_point(|s| s.address <= address);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        Some((symbol, address - symbol.address))
    }

    /// `symbol+0xoff`, `symbol+0xoff [module]`, or `0x<hex>` when unknown
    #[must_use]
    pub fn format(&self, address: u64) -> String {
        match self.lookup(address) {
            Some((symbol, offset)) => {
                let name = demangle(&symbol.name);
                match &symbol.module {
                    Some(module) => format!("{name:#}+{offset:#x} [{module}]"),
                    None => format!("{name:#}+{offset:#x}"),
                }
            }
            None => format!("{address:#x}"),
        }
    }
}

fn parse_line(line: &str) -> Option<KernelSymbol> {
    let mut parts = line.split_whitespace();
    let address = u64::from_str_radix(parts.next()?, 16).ok()?;
    let kind = parts.next()?;
    let name = parts.next()?;
    if address == 0 || !matches!(kind, "t" | "T" | "w" | "W") {
        return None;
    }
    let module = parts
        .next()
        .and_then(|m| m.strip_prefix('['))
        .and_then(|m| m.strip_suffix(']'))
        .map(ToString::to_string);
    Some(KernelSymbol { address, name: name.to_string(), module })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff81000100 t do_one_initcall
ffffffff81200000 D some_data
ffffffff81000200 T __kmalloc
ffffffffc0a01000 t xfs_alloc_read_agf\t[xfs]
0000000000000000 T hidden
ffffffff81000300 T _ZN6kernel4init17h0123456789abcdefE
";

    #[test]
    fn test_parse_filters_non_text() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.len(), 5);
    }

    #[test]
    fn test_lookup_offsets() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.format(0xffff_ffff_8100_021a), "__kmalloc+0x1a");
        assert_eq!(symbols.format(0xffff_ffff_8100_0100), "do_one_initcall+0x0");
        assert_eq!(symbols.format(0xffff_ffff_c0a0_1010), "xfs_alloc_read_agf+0x10 [xfs]");
    }

    #[test]
    fn test_unknown_address_is_hex() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.format(0x1000), "0x1000");
        assert_eq!(KernelSymbols::default().format(0xffff_ffff_8100_0000), "0xffffffff81000000");
    }

    #[test]
    fn test_rust_symbols_are_demangled() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.format(0xffff_ffff_8100_0304), "kernel::init+0x4");
    }

    #[test]
    fn test_from_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        assert_eq!(KernelSymbols::from_path(file.path()).unwrap().len(), 5);
    }
}
