//! opal_codegen: compiles an opal IR module into an ELF64 relocatable
//! object that a System V linker can consume directly.

use std::collections::HashMap;

use opal_elf::constants::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS, STB_GLOBAL, STB_LOCAL, STT_FILE,
    STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION,
};
use opal_elf::{symbol_info, File, RelaEntry, SymbolId};
use opal_ir::module::Module;
use opal_target::{Result, SymbolKind};

/// Compile `module` and wrap the artifact in an `ET_REL` object file.
///
/// The object contains `.text`, `.data` (only if the module has initialized
/// globals), a `.rela.text` section (only if any relocations were emitted),
/// the two string tables, and `.symtab`. Every symbol referenced by a
/// relocation is present: either defined here or added as an undefined
/// `STB_GLOBAL`/`STT_NOTYPE` entry for the linker to resolve.
pub fn generate_object(module: &Module) -> Result<Vec<u8>> {
    let artifact = opal_amd64::compile_module(module)?;

    let mut file = File::new();
    let text = file.add_section(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, artifact.text);
    file.section_mut(text).addr_align = 16;

    let data = if artifact.data.is_empty() {
        None
    } else {
        let data = file.add_section(".data", SHT_PROGBITS, SHF_WRITE | SHF_ALLOC, artifact.data);
        file.section_mut(data).addr_align = 8;
        Some(data)
    };

    file.add_symbol(
        module.name.as_str(),
        symbol_info(STB_LOCAL, STT_FILE),
        None,
        0,
        0,
    );
    file.add_symbol("", symbol_info(STB_LOCAL, STT_SECTION), Some(text), 0, 0);
    if let Some(data) = data {
        file.add_symbol("", symbol_info(STB_LOCAL, STT_SECTION), Some(data), 0, 0);
    }

    let mut symbol_ids: HashMap<&str, SymbolId> = HashMap::new();
    for def in &artifact.symbols {
        let (section, ty) = match def.kind {
            SymbolKind::Function => (Some(text), STT_FUNC),
            SymbolKind::Object => (data, STT_OBJECT),
        };
        let id = file.add_symbol(
            def.name.as_str(),
            symbol_info(STB_GLOBAL, ty),
            section,
            def.offset,
            def.size,
        );
        symbol_ids.insert(def.name.as_str(), id);
    }

    if !artifact.relocations.is_empty() {
        let mut entries = Vec::with_capacity(artifact.relocations.len());
        for reloc in &artifact.relocations {
            let symbol = match symbol_ids.get(reloc.symbol.as_str()) {
                Some(&id) => id,
                None => {
                    // External reference: leave it to the linker.
                    let id = file.add_symbol(
                        reloc.symbol.as_str(),
                        symbol_info(STB_GLOBAL, STT_NOTYPE),
                        None,
                        0,
                        0,
                    );
                    symbol_ids.insert(reloc.symbol.as_str(), id);
                    id
                }
            };
            entries.push(RelaEntry {
                offset: reloc.offset,
                symbol,
                r_type: reloc.kind.elf_type(),
                addend: reloc.addend,
            });
        }
        file.add_relocations(text, entries);
    }

    log::debug!(
        "emitting object for module `{}` ({} relocations)",
        module.name,
        artifact.relocations.len()
    );
    let mut buf = Vec::new();
    file.write_to(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests;
