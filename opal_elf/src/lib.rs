//! opal_elf: a hand-rolled ELF64 relocatable-object writer.
//!
//! The writer builds an `ET_REL` object for `EM_X86_64`: caller-provided
//! sections and symbols, a deduplicated pair of string tables, a symbol
//! table with locals ordered before globals, and `.rela` sections whose
//! contents are packed only once final symbol indices are known.

pub mod constants;
pub mod writer;

pub use writer::{File, RelaEntry, Section, SectionId, Symbol, SymbolId};

/// Build a symbol `st_info` byte from binding and type.
pub fn symbol_info(binding: u8, ty: u8) -> u8 {
    (binding << 4) | (ty & 0xF)
}
