//! The ELF64 relocatable-object model and its serializer.

use std::collections::HashMap;
use std::io::Write;

use opal_target::{Error, Result};

use crate::constants::*;

/// Handle to a section. Section indices are assigned at creation and never
/// change; the handle doubles as the ELF section index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(usize);

impl SectionId {
    /// ELF section header index.
    pub fn index(self) -> u16 {
        self.0 as u16
    }
}

/// Handle to a symbol in declaration order. The final symbol-table index is
/// only assigned when the file is written (locals are ordered first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolId(usize);

/// An ELF section under construction.
#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr_align: u64,
    pub ent_size: u64,
    pub link: u32,
    pub info: u32,
    pub content: Vec<u8>,

    name_offset: u32,
    file_offset: u64,
    size: u64,
}

/// An ELF symbol under construction.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    /// binding << 4 | type.
    pub info: u8,
    pub other: u8,
    /// None for undefined symbols (SHN_UNDEF).
    pub section: Option<SectionId>,
    pub value: u64,
    pub size: u64,

    name_offset: u32,
    final_index: Option<u32>,
}

impl Symbol {
    fn binding(&self) -> u8 {
        self.info >> 4
    }
}

/// One relocation to be packed into a `.rela` section.
#[derive(Debug)]
pub struct RelaEntry {
    /// Offset into the target section.
    pub offset: u64,
    pub symbol: SymbolId,
    pub r_type: u32,
    pub addend: i64,
}

/// A `.rela.X` section whose content is deferred until symbol indices are
/// final.
struct RelaSection {
    section: usize,
    entries: Vec<RelaEntry>,
}

/// Deduplicating ELF string table. Always starts with a NUL byte; the empty
/// string maps to offset 0.
struct StringTable {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            data: vec![0],
            offsets: HashMap::new(),
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.offsets.insert(s.to_string(), offset);
        offset
    }
}

/// An ELF64 relocatable object file under construction.
///
/// Built incrementally, sealed by a single [`File::write_to`] call.
pub struct File {
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    strtab: StringTable,
    shstrtab: StringTable,
    relas: Vec<RelaSection>,
}

impl File {
    /// Create an object file containing only the null section.
    pub fn new() -> Self {
        Self {
            sections: vec![Section {
                name: String::new(),
                sh_type: SHT_NULL,
                flags: 0,
                addr_align: 0,
                ent_size: 0,
                link: 0,
                info: 0,
                content: Vec::new(),
                name_offset: 0,
                file_offset: 0,
                size: 0,
            }],
            symbols: Vec::new(),
            strtab: StringTable::new(),
            shstrtab: StringTable::new(),
            relas: Vec::new(),
        }
    }

    pub fn add_section(
        &mut self,
        name: impl Into<String>,
        sh_type: u32,
        flags: u64,
        content: Vec<u8>,
    ) -> SectionId {
        let id = SectionId(self.sections.len());
        self.sections.push(Section {
            name: name.into(),
            sh_type,
            flags,
            addr_align: 0,
            ent_size: 0,
            link: 0,
            info: 0,
            content,
            name_offset: 0,
            file_offset: 0,
            size: 0,
        });
        id
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn add_symbol(
        &mut self,
        name: impl Into<String>,
        info: u8,
        section: Option<SectionId>,
        value: u64,
        size: u64,
    ) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: name.into(),
            info,
            other: STV_DEFAULT,
            section,
            value,
            size,
            name_offset: 0,
            final_index: None,
        });
        id
    }

    /// Attach relocation entries to `target`, creating the matching
    /// `.rela.X` section. Content is packed during [`File::write_to`], once
    /// final symbol-table indices exist.
    pub fn add_relocations(&mut self, target: SectionId, entries: Vec<RelaEntry>) -> SectionId {
        let name = format!(".rela{}", self.sections[target.0].name);
        let rela = self.add_section(name, SHT_RELA, SHF_INFO_LINK, Vec::new());
        {
            let sec = self.section_mut(rela);
            sec.ent_size = RELA_SIZE;
            sec.addr_align = 8;
            sec.info = target.index() as u32;
        }
        self.relas.push(RelaSection {
            section: rela.0,
            entries,
        });
        rela
    }

    /// Seal the file and write it to `w`.
    ///
    /// Symbol-table order is null, then locals, then globals;
    /// `.symtab.sh_info` is the index of the first global. Relocation
    /// contents are packed here, after final indices are assigned, so
    /// symbols added late (e.g. undefined externals) still relocate
    /// correctly.
    pub fn write_to<W: Write>(mut self, w: &mut W) -> Result<()> {
        let shstrtab = self.add_section(".shstrtab", SHT_STRTAB, 0, Vec::new());
        self.section_mut(shstrtab).addr_align = 1;
        let strtab = self.add_section(".strtab", SHT_STRTAB, 0, Vec::new());
        self.section_mut(strtab).addr_align = 1;

        // Partition symbols: index 0 is the null symbol, locals precede
        // globals and weaks.
        let mut next_index = 1u32;
        for sym in self.symbols.iter_mut().filter(|s| s.binding() == STB_LOCAL) {
            sym.final_index = Some(next_index);
            next_index += 1;
        }
        let first_global = next_index;
        for sym in self.symbols.iter_mut().filter(|s| s.binding() != STB_LOCAL) {
            sym.final_index = Some(next_index);
            next_index += 1;
        }

        let symtab = self.add_section(".symtab", SHT_SYMTAB, 0, Vec::new());
        {
            let sec = self.section_mut(symtab);
            sec.link = strtab.index() as u32;
            sec.info = first_global;
            sec.ent_size = SYM_SIZE;
            sec.addr_align = 8;
        }

        // Every relocation section links against the symbol table.
        for rela in &self.relas {
            self.sections[rela.section].link = symtab.index() as u32;
        }

        // Intern names now that the section and symbol sets are complete.
        for sec in &mut self.sections {
            sec.name_offset = self.shstrtab.add(&sec.name);
        }
        for sym in &mut self.symbols {
            sym.name_offset = self.strtab.add(&sym.name);
        }

        let packed_symtab = self.pack_symtab();
        self.sections[symtab.0].content = packed_symtab;
        for i in 0..self.relas.len() {
            let packed = self.pack_rela(&self.relas[i])?;
            let section = self.relas[i].section;
            self.sections[section].content = packed;
        }
        self.sections[shstrtab.0].content = std::mem::take(&mut self.shstrtab.data);
        self.sections[strtab.0].content = std::mem::take(&mut self.strtab.data);

        // Lay out section contents after the ELF header.
        let mut offset = EHDR_SIZE;
        for sec in &mut self.sections {
            if sec.sh_type == SHT_NULL {
                continue;
            }
            if sec.addr_align > 1 {
                offset = offset.div_ceil(sec.addr_align) * sec.addr_align;
            }
            sec.file_offset = offset;
            sec.size = sec.content.len() as u64;
            offset += sec.size;
            log::trace!(
                "section {} at {:#x}, {} bytes",
                sec.name,
                sec.file_offset,
                sec.size
            );
        }
        let shoff = offset.div_ceil(8) * 8;

        self.write_header(w, shoff, shstrtab.index())?;

        let mut written = EHDR_SIZE;
        for sec in &self.sections {
            if sec.sh_type == SHT_NULL {
                continue;
            }
            if sec.file_offset > written {
                w.write_all(&vec![0u8; (sec.file_offset - written) as usize])?;
                written = sec.file_offset;
            }
            w.write_all(&sec.content)?;
            written += sec.size;
        }
        if shoff > written {
            w.write_all(&vec![0u8; (shoff - written) as usize])?;
        }

        for sec in &self.sections {
            write_section_header(w, sec)?;
        }
        Ok(())
    }

    fn write_header<W: Write>(&self, w: &mut W, shoff: u64, shstrndx: u16) -> Result<()> {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        ident[6] = EV_CURRENT;

        w.write_all(&ident)?;
        w.write_all(&ET_REL.to_le_bytes())?;
        w.write_all(&EM_X86_64.to_le_bytes())?;
        w.write_all(&(EV_CURRENT as u32).to_le_bytes())?;
        w.write_all(&0u64.to_le_bytes())?; // e_entry
        w.write_all(&0u64.to_le_bytes())?; // e_phoff
        w.write_all(&shoff.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?; // e_flags
        w.write_all(&(EHDR_SIZE as u16).to_le_bytes())?;
        w.write_all(&0u16.to_le_bytes())?; // e_phentsize
        w.write_all(&0u16.to_le_bytes())?; // e_phnum
        w.write_all(&SHDR_SIZE.to_le_bytes())?;
        w.write_all(&(self.sections.len() as u16).to_le_bytes())?;
        w.write_all(&shstrndx.to_le_bytes())?;
        Ok(())
    }

    /// Pack the symbol table: a null entry, then every symbol in its final
    /// partitioned order.
    fn pack_symtab(&self) -> Vec<u8> {
        let mut ordered: Vec<&Symbol> = self.symbols.iter().collect();
        ordered.sort_by_key(|s| s.final_index);

        let mut buf = Vec::with_capacity((ordered.len() + 1) * SYM_SIZE as usize);
        buf.extend_from_slice(&[0u8; 24]);
        for sym in ordered {
            let shndx = match sym.section {
                Some(id) => id.index(),
                None => SHN_UNDEF,
            };
            buf.extend_from_slice(&sym.name_offset.to_le_bytes());
            buf.push(sym.info);
            buf.push(sym.other);
            buf.extend_from_slice(&shndx.to_le_bytes());
            buf.extend_from_slice(&sym.value.to_le_bytes());
            buf.extend_from_slice(&sym.size.to_le_bytes());
        }
        buf
    }

    /// Pack `Elf64_Rela` records using final symbol indices.
    fn pack_rela(&self, rela: &RelaSection) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(rela.entries.len() * RELA_SIZE as usize);
        for entry in &rela.entries {
            let sym = &self.symbols[entry.symbol.0];
            let index = sym.final_index.ok_or_else(|| {
                Error::layout(format!(
                    "relocation against `{}` before symbol indices were assigned",
                    sym.name
                ))
            })?;
            let info = ((index as u64) << 32) | entry.r_type as u64;
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&info.to_le_bytes());
            buf.extend_from_slice(&entry.addend.to_le_bytes());
        }
        Ok(buf)
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

fn write_section_header<W: Write>(w: &mut W, sec: &Section) -> Result<()> {
    w.write_all(&sec.name_offset.to_le_bytes())?;
    w.write_all(&sec.sh_type.to_le_bytes())?;
    w.write_all(&sec.flags.to_le_bytes())?;
    w.write_all(&0u64.to_le_bytes())?; // sh_addr
    w.write_all(&sec.file_offset.to_le_bytes())?;
    w.write_all(&sec.size.to_le_bytes())?;
    w.write_all(&sec.link.to_le_bytes())?;
    w.write_all(&sec.info.to_le_bytes())?;
    w.write_all(&sec.addr_align.to_le_bytes())?;
    w.write_all(&sec.ent_size.to_le_bytes())?;
    Ok(())
}
