//! The one ELF symbol-table/relocation reader shared by the supervisor's
//! remote symbol resolution (§4.2) and the agent's PLT hook engine (§4.6
//! item 2), built on `object` so there is a single parser for
//! `.dynsym`/`.symtab`/relocations across the whole codebase instead of one
//! per component.

use object::{Object, ObjectSymbol, RelocationTarget};

/// Resolves `name` to its address in `path`'s local (i.e. this-process, not
/// remote) symbol table, checking dynamic symbols first since that is where
/// libc/libdl exports live.
pub fn resolve_symbol_in_file(path: &str, name: &str) -> Option<u64> {
    let data = std::fs::read(path).ok()?;
    let file = object::File::parse(&*data).ok()?;
    file.dynamic_symbols()
        .chain(file.symbols())
        .find(|sym| sym.name() == Ok(name))
        .map(|sym| sym.address())
}

#[derive(Debug, Clone)]
pub struct PltRelocation {
    /// Offset (relative to the object's load base) of the GOT slot this
    /// relocation resolves into.
    pub offset: u64,
    pub symbol: String,
}

/// Every dynamic relocation in an ELF image (the `DT_JMPREL`/`.rela.plt`
/// table in practice, plus ordinary `.rela.dyn` GLOB_DAT entries used for
/// data symbols), resolved to the symbol name each one targets.
pub fn plt_relocations(data: &[u8]) -> Vec<PltRelocation> {
    let Ok(file) = object::File::parse(data) else { return Vec::new() };
    let Some(relocations) = file.dynamic_relocations() else { return Vec::new() };

    relocations
        .filter_map(|(offset, reloc)| {
            let RelocationTarget::Symbol(index) = reloc.target() else { return None };
            let symbol = file.symbol_by_index(index).ok()?;
            Some(PltRelocation { offset, symbol: symbol.name().ok()?.to_string() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_resolves_to_none() {
        assert_eq!(resolve_symbol_in_file("/nonexistent/path.so", "dlopen"), None);
    }

    #[test]
    fn garbage_data_yields_no_relocations() {
        assert!(plt_relocations(b"not an elf file").is_empty());
    }
}
